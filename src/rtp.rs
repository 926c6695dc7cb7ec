// RTP packet handling, session bookkeeping and the jitter buffer

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use rand::Rng;
use serde::Serialize;

use crate::{Error, Result};

/// RFC 4733 telephone-event payload type used in our offers.
pub const TELEPHONE_EVENT_PT: u8 = 101;

pub const RTP_HEADER_LEN: usize = 12;

// RTP packet header (RFC 3550 §5.1)
#[derive(Debug, Clone, Copy)]
pub struct RtpHeader {
    pub version: u8,
    pub padding: bool,
    pub extension: bool,
    pub csrc_count: u8,
    pub marker: bool,
    pub payload_type: u8,
    pub sequence: u16,
    pub timestamp: u32,
    pub ssrc: u32,
}

impl RtpHeader {
    pub fn new(payload_type: u8, sequence: u16, timestamp: u32, ssrc: u32, marker: bool) -> Self {
        RtpHeader {
            version: 2,
            padding: false,
            extension: false,
            csrc_count: 0,
            marker,
            payload_type,
            sequence,
            timestamp,
            ssrc,
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < RTP_HEADER_LEN {
            return Err(Error::Parse("RTP packet too short".to_string()));
        }
        Ok(RtpHeader {
            version: data[0] >> 6,
            padding: data[0] & 0x20 != 0,
            extension: data[0] & 0x10 != 0,
            csrc_count: data[0] & 0x0F,
            marker: data[1] & 0x80 != 0,
            payload_type: data[1] & 0x7F,
            sequence: u16::from_be_bytes([data[2], data[3]]),
            timestamp: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ssrc: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; RTP_HEADER_LEN] {
        let mut out = [0u8; RTP_HEADER_LEN];
        out[0] = (self.version << 6)
            | ((self.padding as u8) << 5)
            | ((self.extension as u8) << 4)
            | self.csrc_count;
        out[1] = ((self.marker as u8) << 7) | self.payload_type;
        out[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        out[4..8].copy_from_slice(&self.timestamp.to_be_bytes());
        out[8..12].copy_from_slice(&self.ssrc.to_be_bytes());
        out
    }
}

#[derive(Debug, Clone)]
pub struct RtpPacket {
    pub header: RtpHeader,
    pub payload: Vec<u8>,
}

impl RtpPacket {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = RtpHeader::parse(data)?;
        if header.version != 2 {
            return Err(Error::Parse(format!("RTP version {}", header.version)));
        }

        let mut offset = RTP_HEADER_LEN + header.csrc_count as usize * 4;
        if data.len() < offset {
            return Err(Error::Parse("RTP packet truncated at CSRC list".to_string()));
        }
        if header.extension {
            if data.len() < offset + 4 {
                return Err(Error::Parse("RTP packet truncated at extension".to_string()));
            }
            let ext_words = u16::from_be_bytes([data[offset + 2], data[offset + 3]]) as usize;
            offset += 4 + ext_words * 4;
            if data.len() < offset {
                return Err(Error::Parse("RTP extension overruns packet".to_string()));
            }
        }

        let mut payload = data[offset..].to_vec();
        if header.padding {
            let pad = payload.last().copied().unwrap_or(0) as usize;
            if pad == 0 || pad > payload.len() {
                return Err(Error::Parse("bad RTP padding".to_string()));
            }
            payload.truncate(payload.len() - pad);
        }

        Ok(RtpPacket { header, payload })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RTP_HEADER_LEN + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// What an inbound datagram turned out to be.
#[derive(Debug)]
pub enum RtpInput {
    Audio {
        payload: Vec<u8>,
        sequence: u16,
        timestamp: u32,
    },
    /// RFC 4733 telephone-event payload.
    TelephoneEvent { payload: Vec<u8>, timestamp: u32 },
    /// Counted and dropped.
    Discard(&'static str),
    /// Peer switched SSRC mid-stream; the jitter buffer must reset.
    SsrcChanged,
}

// Running per-direction counters; snapshots are lock-free reads.
#[derive(Debug, Default)]
pub struct RtpStats {
    pub packets_in: AtomicU64,
    pub packets_out: AtomicU64,
    pub bytes_in: AtomicU64,
    pub bytes_out: AtomicU64,
    pub loss_count: AtomicU64,
    pub late_count: AtomicU64,
    pub reorder_count: AtomicU64,
    pub duplicate_count: AtomicU64,
    pub discard_count: AtomicU64,
    pub ssrc_changes: AtomicU64,
    /// RFC 3550 interarrival jitter estimate, in timestamp units.
    pub max_jitter: AtomicU32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RtpStatsSnapshot {
    pub packets_in: u64,
    pub packets_out: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub loss_count: u64,
    pub late_count: u64,
    pub reorder_count: u64,
    pub duplicate_count: u64,
    pub discard_count: u64,
    pub ssrc_changes: u64,
    pub max_jitter: u32,
}

impl RtpStats {
    pub fn snapshot(&self) -> RtpStatsSnapshot {
        RtpStatsSnapshot {
            packets_in: self.packets_in.load(Ordering::Relaxed),
            packets_out: self.packets_out.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
            loss_count: self.loss_count.load(Ordering::Relaxed),
            late_count: self.late_count.load(Ordering::Relaxed),
            reorder_count: self.reorder_count.load(Ordering::Relaxed),
            duplicate_count: self.duplicate_count.load(Ordering::Relaxed),
            discard_count: self.discard_count.load(Ordering::Relaxed),
            ssrc_changes: self.ssrc_changes.load(Ordering::Relaxed),
            max_jitter: self.max_jitter.load(Ordering::Relaxed),
        }
    }
}

// Per-call RTP session: egress sequencing and ingress classification.
pub struct RtpSession {
    ssrc: u32,
    sequence: u16,
    timestamp: u32,
    audio_payload_type: u8,
    dtmf_payload_type: Option<u8>,
    remote_ssrc: Option<u32>,
    // Jitter estimator state
    last_transit: Option<i64>,
    jitter: f64,
}

impl RtpSession {
    pub fn new(audio_payload_type: u8, dtmf_payload_type: Option<u8>) -> Self {
        let mut rng = rand::thread_rng();
        RtpSession {
            ssrc: rng.gen(),
            sequence: rng.gen(),
            timestamp: rng.gen(),
            audio_payload_type,
            dtmf_payload_type,
            remote_ssrc: None,
            last_transit: None,
            jitter: 0.0,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Build the next egress packet; the timestamp advances by the frame's
    /// sample count after each send.
    pub fn packetize(&mut self, payload: Vec<u8>, samples: u32, marker: bool) -> RtpPacket {
        let header = RtpHeader::new(
            self.audio_payload_type,
            self.sequence,
            self.timestamp,
            self.ssrc,
            marker,
        );
        self.sequence = self.sequence.wrapping_add(1);
        self.timestamp = self.timestamp.wrapping_add(samples);
        RtpPacket { header, payload }
    }

    /// Classify an inbound datagram. The first packet's SSRC is adopted;
    /// a mid-stream change is reported once, then the new SSRC is adopted.
    pub fn classify(&mut self, datagram: &[u8], stats: &RtpStats, arrival_ts: u32) -> RtpInput {
        let packet = match RtpPacket::parse(datagram) {
            Ok(p) => p,
            Err(_) => {
                stats.discard_count.fetch_add(1, Ordering::Relaxed);
                return RtpInput::Discard("malformed");
            }
        };

        match self.remote_ssrc {
            None => self.remote_ssrc = Some(packet.header.ssrc),
            Some(current) if current != packet.header.ssrc => {
                self.remote_ssrc = Some(packet.header.ssrc);
                self.last_transit = None;
                self.jitter = 0.0;
                stats.ssrc_changes.fetch_add(1, Ordering::Relaxed);
                return RtpInput::SsrcChanged;
            }
            _ => {}
        }

        stats.packets_in.fetch_add(1, Ordering::Relaxed);
        stats
            .bytes_in
            .fetch_add(datagram.len() as u64, Ordering::Relaxed);

        if Some(packet.header.payload_type) == self.dtmf_payload_type {
            return RtpInput::TelephoneEvent {
                payload: packet.payload,
                timestamp: packet.header.timestamp,
            };
        }

        if packet.header.payload_type != self.audio_payload_type {
            stats.discard_count.fetch_add(1, Ordering::Relaxed);
            return RtpInput::Discard("foreign payload type");
        }

        self.update_jitter(packet.header.timestamp, arrival_ts, stats);

        RtpInput::Audio {
            payload: packet.payload,
            sequence: packet.header.sequence,
            timestamp: packet.header.timestamp,
        }
    }

    // RFC 3550 §6.4.1 interarrival jitter, arrival clock in timestamp units
    fn update_jitter(&mut self, rtp_ts: u32, arrival_ts: u32, stats: &RtpStats) {
        let transit = arrival_ts as i64 - rtp_ts as i64;
        if let Some(last) = self.last_transit {
            let d = (transit - last).abs() as f64;
            self.jitter += (d - self.jitter) / 16.0;
            let current = stats.max_jitter.load(Ordering::Relaxed);
            let rounded = self.jitter as u32;
            if rounded > current {
                stats.max_jitter.store(rounded, Ordering::Relaxed);
            }
        }
        self.last_transit = Some(transit);
    }
}

/// Wrapping sequence-number comparison: negative when `a` precedes `b`.
fn seq_delta(a: u16, b: u16) -> i32 {
    a.wrapping_sub(b) as i16 as i32
}

#[derive(Debug, PartialEq, Eq)]
pub enum JitterInsert {
    Inserted,
    Duplicate,
    Late,
    /// Replaced the oldest entry because the buffer was at capacity.
    Overflow,
}

#[derive(Debug, PartialEq, Eq)]
pub enum JitterPop {
    /// The next sequential frame.
    Frame(Vec<u8>),
    /// Frame missing; caller conceals and the cursor advances past it.
    Missing,
    /// Nothing buffered yet.
    Empty,
}

// Bounded reorder buffer keyed by sequence number. The playout cursor
// advances one frame per 20 ms tick once the first packet has arrived.
pub struct JitterBuffer {
    // Sorted by wrapping distance from the cursor; small, so a BTreeMap on
    // the normalized offset is enough
    entries: BTreeMap<i32, (u16, Vec<u8>)>,
    next_seq: Option<u16>,
    capacity: usize,
    max_late_frames: i32,
}

impl JitterBuffer {
    pub fn new(target_depth_ms: u32, max_late_ms: u32) -> Self {
        let capacity = ((target_depth_ms + max_late_ms) / 20).max(2) as usize;
        JitterBuffer {
            entries: BTreeMap::new(),
            next_seq: None,
            capacity,
            max_late_frames: (max_late_ms / 20).max(1) as i32,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn insert(&mut self, sequence: u16, payload: Vec<u8>, stats: &RtpStats) -> JitterInsert {
        let cursor = match self.next_seq {
            None => {
                self.next_seq = Some(sequence);
                sequence
            }
            Some(c) => c,
        };

        let offset = seq_delta(sequence, cursor);
        if offset < 0 {
            if -offset > self.max_late_frames {
                stats.loss_count.fetch_add(1, Ordering::Relaxed);
                stats.late_count.fetch_add(1, Ordering::Relaxed);
                return JitterInsert::Late;
            }
            // Arrived after its slot was concealed; nothing to do with it
            stats.late_count.fetch_add(1, Ordering::Relaxed);
            return JitterInsert::Late;
        }

        if self.entries.contains_key(&offset) {
            stats.duplicate_count.fetch_add(1, Ordering::Relaxed);
            return JitterInsert::Duplicate;
        }

        if let Some((&last_offset, _)) = self.entries.iter().next_back() {
            if offset < last_offset {
                stats.reorder_count.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.entries.insert(offset, (sequence, payload));

        if self.entries.len() > self.capacity {
            let oldest = *self.entries.keys().next().unwrap();
            self.entries.remove(&oldest);
            stats.loss_count.fetch_add(1, Ordering::Relaxed);
            return JitterInsert::Overflow;
        }

        JitterInsert::Inserted
    }

    /// Release the frame at the cursor (or report it missing) and advance.
    pub fn pop(&mut self, stats: &RtpStats) -> JitterPop {
        let cursor = match self.next_seq {
            Some(c) => c,
            None => return JitterPop::Empty,
        };
        if self.entries.is_empty() {
            return JitterPop::Empty;
        }

        let result = match self.entries.remove(&0) {
            Some((_, payload)) => JitterPop::Frame(payload),
            None => {
                stats.loss_count.fetch_add(1, Ordering::Relaxed);
                JitterPop::Missing
            }
        };

        self.next_seq = Some(cursor.wrapping_add(1));
        // Re-key remaining entries against the advanced cursor
        let old = std::mem::take(&mut self.entries);
        self.entries = old.into_iter().map(|(k, v)| (k - 1, v)).collect();

        result
    }

    /// Drop everything and forget the cursor (SSRC change).
    pub fn reset(&mut self) {
        self.entries.clear();
        self.next_seq = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = RtpHeader::new(0, 1234, 567_890, 0x1234_5678, true);
        let bytes = header.to_bytes();
        let parsed = RtpHeader::parse(&bytes).unwrap();
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.payload_type, 0);
        assert_eq!(parsed.sequence, 1234);
        assert_eq!(parsed.timestamp, 567_890);
        assert_eq!(parsed.ssrc, 0x1234_5678);
        assert!(parsed.marker);
    }

    #[test]
    fn test_packet_padding_and_truncation() {
        let header = RtpHeader::new(0, 1, 160, 7, false);
        let mut raw = header.to_bytes().to_vec();
        raw.extend_from_slice(&[1, 2, 3, 4, 0, 0, 2]);
        raw[0] |= 0x20; // padding flag, last byte says two pad bytes
        let packet = RtpPacket::parse(&raw).unwrap();
        assert_eq!(packet.payload, vec![1, 2, 3, 4, 0]);

        assert!(RtpPacket::parse(&raw[..8]).is_err());
    }

    #[test]
    fn test_session_sequencing() {
        let mut session = RtpSession::new(0, Some(101));
        let first = session.packetize(vec![0u8; 160], 160, true);
        let second = session.packetize(vec![0u8; 160], 160, false);
        assert_eq!(
            second.header.sequence,
            first.header.sequence.wrapping_add(1)
        );
        assert_eq!(
            second.header.timestamp,
            first.header.timestamp.wrapping_add(160)
        );
        assert_eq!(first.header.ssrc, second.header.ssrc);
    }

    #[test]
    fn test_classify_routes_dtmf_and_audio() {
        let mut session = RtpSession::new(0, Some(101));
        let stats = RtpStats::default();

        let audio = RtpPacket {
            header: RtpHeader::new(0, 10, 160, 42, false),
            payload: vec![0xFF; 160],
        };
        match session.classify(&audio.to_bytes(), &stats, 0) {
            RtpInput::Audio { sequence, .. } => assert_eq!(sequence, 10),
            other => panic!("expected audio, got {:?}", other),
        }

        let dtmf = RtpPacket {
            header: RtpHeader::new(101, 11, 320, 42, true),
            payload: vec![5, 0x8A, 0, 160],
        };
        match session.classify(&dtmf.to_bytes(), &stats, 160) {
            RtpInput::TelephoneEvent { payload, .. } => assert_eq!(payload[0], 5),
            other => panic!("expected telephone-event, got {:?}", other),
        }

        assert_eq!(stats.packets_in.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_ssrc_change_detected_once() {
        let mut session = RtpSession::new(0, None);
        let stats = RtpStats::default();

        let pkt = |ssrc: u32, seq: u16| {
            RtpPacket {
                header: RtpHeader::new(0, seq, seq as u32 * 160, ssrc, false),
                payload: vec![0xFF; 160],
            }
            .to_bytes()
        };

        assert!(matches!(
            session.classify(&pkt(1, 0), &stats, 0),
            RtpInput::Audio { .. }
        ));
        assert!(matches!(
            session.classify(&pkt(2, 1), &stats, 160),
            RtpInput::SsrcChanged
        ));
        // The new SSRC is adopted afterwards
        assert!(matches!(
            session.classify(&pkt(2, 2), &stats, 320),
            RtpInput::Audio { .. }
        ));
        assert_eq!(stats.ssrc_changes.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_jitter_buffer_in_order() {
        let mut jb = JitterBuffer::new(40, 60);
        let stats = RtpStats::default();
        assert_eq!(jb.pop(&stats), JitterPop::Empty);

        jb.insert(100, vec![1], &stats);
        jb.insert(101, vec![2], &stats);
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![1]));
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![2]));
        assert_eq!(jb.pop(&stats), JitterPop::Empty);
    }

    #[test]
    fn test_jitter_buffer_reorders() {
        let mut jb = JitterBuffer::new(40, 60);
        let stats = RtpStats::default();

        jb.insert(100, vec![1], &stats);
        jb.insert(102, vec![3], &stats);
        jb.insert(101, vec![2], &stats);

        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![1]));
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![2]));
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![3]));
        assert_eq!(stats.reorder_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_jitter_buffer_conceals_gap() {
        let mut jb = JitterBuffer::new(40, 60);
        let stats = RtpStats::default();

        jb.insert(100, vec![1], &stats);
        jb.insert(102, vec![3], &stats);

        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![1]));
        assert_eq!(jb.pop(&stats), JitterPop::Missing);
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![3]));
        assert_eq!(stats.loss_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_jitter_buffer_drops_duplicates_and_late() {
        let mut jb = JitterBuffer::new(40, 60);
        let stats = RtpStats::default();

        jb.insert(100, vec![1], &stats);
        assert_eq!(jb.insert(100, vec![1], &stats), JitterInsert::Duplicate);

        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![1]));
        // Cursor is now 101; 95 is more than three frames behind
        assert_eq!(jb.insert(95, vec![9], &stats), JitterInsert::Late);
        assert_eq!(stats.duplicate_count.load(Ordering::Relaxed), 1);
        assert!(stats.late_count.load(Ordering::Relaxed) >= 1);
    }

    #[test]
    fn test_jitter_buffer_bounded() {
        let mut jb = JitterBuffer::new(40, 60);
        let stats = RtpStats::default();
        let capacity = (40 + 60) / 20;

        for i in 0..=capacity as u16 {
            jb.insert(100 + i, vec![i as u8], &stats);
        }
        assert_eq!(jb.len(), capacity as usize);
    }

    #[test]
    fn test_jitter_buffer_wraparound() {
        let mut jb = JitterBuffer::new(40, 60);
        let stats = RtpStats::default();

        jb.insert(65_534, vec![1], &stats);
        jb.insert(65_535, vec![2], &stats);
        jb.insert(0, vec![3], &stats);

        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![1]));
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![2]));
        assert_eq!(jb.pop(&stats), JitterPop::Frame(vec![3]));
    }
}
