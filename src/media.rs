// Per-call media pipeline: RTP ingress/egress, codec transform, resampling,
// jitter buffering and DTMF extraction

use std::collections::VecDeque;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::codec::{CodecKind, Resampler, FRAME_16K, FRAME_8K};
use crate::dtmf::{DtmfEvent, GoertzelDetector, Rfc2833Decoder};
use crate::ports::PortPair;
use crate::rtp::{JitterBuffer, JitterPop, RtpInput, RtpSession, RtpStats, RtpStatsSnapshot};
use crate::{Error, Result};

/// Egress queue bound, in 20 ms frames.
const EGRESS_QUEUE_FRAMES: usize = 10;
/// Packet-loss concealment gain (-3 dB).
const PLC_GAIN: f32 = 0.708;

/// Events the pipeline raises to its owning call.
#[derive(Debug)]
pub enum MediaOut {
    /// One decoded, upsampled 20 ms frame (320 samples at 16 kHz).
    Audio16k(Vec<i16>),
    Dtmf(DtmfEvent),
    /// No RTP ingress for the configured window.
    RtpTimeout,
    /// The media socket failed; the call must end.
    Fatal(String),
}

#[derive(Debug, Clone)]
pub struct MediaSessionConfig {
    pub local_ip: IpAddr,
    pub ports: PortPair,
    pub remote_addr: SocketAddr,
    pub codec: CodecKind,
    pub dtmf_payload_type: Option<u8>,
    pub jitter_target_ms: u32,
    pub jitter_max_late_ms: u32,
    pub rtp_timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaStatsSnapshot {
    #[serde(flatten)]
    pub rtp: RtpStatsSnapshot,
    pub egress_overflow: u64,
}

// Egress side: PCM16@16k pushed by the bridge, drained one frame per tick.
struct EgressBuffer {
    frames: VecDeque<Vec<i16>>,
    partial: Vec<i16>,
    overflow: Arc<AtomicU64>,
}

impl EgressBuffer {
    fn push(&mut self, pcm: &[i16]) {
        self.partial.extend_from_slice(pcm);
        while self.partial.len() >= FRAME_16K {
            let frame: Vec<i16> = self.partial.drain(..FRAME_16K).collect();
            if self.frames.len() >= EGRESS_QUEUE_FRAMES {
                self.frames.pop_front();
                self.overflow.fetch_add(1, Ordering::Relaxed);
            }
            self.frames.push_back(frame);
        }
    }

    fn pop(&mut self) -> Option<Vec<i16>> {
        self.frames.pop_front()
    }
}

pub struct MediaSession {
    config: MediaSessionConfig,
    socket: Arc<UdpSocket>,
    stats: Arc<RtpStats>,
    egress: Arc<StdMutex<EgressBuffer>>,
    egress_overflow: Arc<AtomicU64>,
    hold: Arc<AtomicBool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MediaSession {
    /// Bind the RTP socket and start the pipeline task. Events flow to
    /// `out_tx`; the port pair stays leased until the owner releases it.
    pub async fn start(
        config: MediaSessionConfig,
        out_tx: mpsc::Sender<MediaOut>,
    ) -> Result<Arc<Self>> {
        let bind_addr = SocketAddr::new(config.local_ip, config.ports.rtp);
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| Error::Media(format!("RTP bind {}: {}", bind_addr, e)))?;

        let egress_overflow = Arc::new(AtomicU64::new(0));
        let session = Arc::new(MediaSession {
            socket: Arc::new(socket),
            stats: Arc::new(RtpStats::default()),
            egress: Arc::new(StdMutex::new(EgressBuffer {
                frames: VecDeque::new(),
                partial: Vec::new(),
                overflow: egress_overflow.clone(),
            })),
            egress_overflow,
            hold: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
            config,
        });

        let task = tokio::spawn(session.clone().run(out_tx));
        *session.task.lock().await = Some(task);
        Ok(session)
    }

    /// Queue AI audio for the egress path. Non-blocking; the oldest frame is
    /// dropped when the bound is hit.
    pub fn push_egress_pcm16_16k(&self, pcm: &[i16]) {
        self.egress.lock().unwrap().push(pcm);
    }

    /// Suppress egress RTP while the call is holding.
    pub fn set_hold(&self, hold: bool) {
        self.hold.store(hold, Ordering::Relaxed);
    }

    pub fn local_rtp_port(&self) -> u16 {
        self.config.ports.rtp
    }

    pub fn stats(&self) -> MediaStatsSnapshot {
        MediaStatsSnapshot {
            rtp: self.stats.snapshot(),
            egress_overflow: self.egress_overflow.load(Ordering::Relaxed),
        }
    }

    pub async fn stop(&self) {
        if let Some(task) = self.task.lock().await.take() {
            task.abort();
        }
        debug!(port = self.config.ports.rtp, "media session stopped");
    }

    // The single pipeline task: socket reads and the 20 ms tick are
    // serialized here, so all codec/jitter/DTMF state is task-local.
    async fn run(self: Arc<Self>, out_tx: mpsc::Sender<MediaOut>) {
        let mut rtp = RtpSession::new(
            self.config.codec.payload_type(),
            self.config.dtmf_payload_type,
        );
        let mut jitter = JitterBuffer::new(
            self.config.jitter_target_ms,
            self.config.jitter_max_late_ms,
        );
        let mut resampler = Resampler::new();
        let mut rfc2833 = Rfc2833Decoder::new();
        let mut goertzel = GoertzelDetector::new();

        let started = Instant::now();
        let mut last_ingress = Instant::now();
        let mut rtp_timeout_reported = false;
        let mut last_frame_8k: Vec<i16> = vec![0; FRAME_8K];
        let mut first_egress = true;

        let mut ticker = interval(Duration::from_millis(20));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut buffer = vec![0u8; 2048];

        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buffer) => {
                    let (size, source) = match received {
                        Ok(ok) => ok,
                        Err(e) => {
                            let _ = out_tx
                                .send(MediaOut::Fatal(format!("RTP receive: {}", e)))
                                .await;
                            return;
                        }
                    };
                    if source.ip() != self.config.remote_addr.ip() {
                        self.stats.discard_count.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    last_ingress = Instant::now();
                    rtp_timeout_reported = false;

                    let arrival_ts = (started.elapsed().as_millis() as u32).wrapping_mul(8);
                    match rtp.classify(&buffer[..size], &self.stats, arrival_ts) {
                        RtpInput::Audio { payload, sequence, .. } => {
                            jitter.insert(sequence, payload, &self.stats);
                        }
                        RtpInput::TelephoneEvent { payload, timestamp } => {
                            if let Some(event) = rfc2833.on_payload(&payload, timestamp) {
                                let _ = out_tx.send(MediaOut::Dtmf(event)).await;
                            }
                        }
                        RtpInput::SsrcChanged => jitter.reset(),
                        RtpInput::Discard(reason) => {
                            debug!(reason, "RTP packet discarded");
                        }
                    }
                }
                _ = ticker.tick() => {
                    // Ingress playout: release the next frame or conceal
                    let pcm_8k = match jitter.pop(&self.stats) {
                        JitterPop::Frame(payload) => {
                            match self.config.codec.decode_frame(&payload) {
                                Ok(pcm) => Some(pcm),
                                Err(_) => {
                                    self.stats.discard_count.fetch_add(1, Ordering::Relaxed);
                                    None
                                }
                            }
                        }
                        JitterPop::Missing => {
                            // Conceal with the previous frame at -3 dB
                            Some(
                                last_frame_8k
                                    .iter()
                                    .map(|&s| (s as f32 * PLC_GAIN) as i16)
                                    .collect(),
                            )
                        }
                        JitterPop::Empty => None,
                    };

                    if let Some(pcm) = pcm_8k {
                        last_frame_8k = pcm.clone();
                        if let Some(event) = goertzel.process_frame(&pcm) {
                            let _ = out_tx.send(MediaOut::Dtmf(event)).await;
                        }
                        if let Ok(pcm_16k) = resampler.upsample_8k_to_16k(&pcm) {
                            // Audio is droppable under backpressure
                            let _ = out_tx.try_send(MediaOut::Audio16k(pcm_16k));
                        }
                    }

                    // Egress: one frame per tick toward the peer
                    if !self.hold.load(Ordering::Relaxed) {
                        let frame_16k = self.egress.lock().unwrap().pop();
                        if let Some(frame) = frame_16k {
                            if let Err(e) = self
                                .send_egress_frame(&mut rtp, &mut resampler, &frame, first_egress)
                                .await
                            {
                                let _ = out_tx.send(MediaOut::Fatal(e.to_string())).await;
                                return;
                            }
                            first_egress = false;
                        }
                    }

                    // No-media watchdog
                    if !rtp_timeout_reported
                        && last_ingress.elapsed() >= self.config.rtp_timeout
                    {
                        rtp_timeout_reported = true;
                        let _ = out_tx.send(MediaOut::RtpTimeout).await;
                    }
                }
            }
        }
    }

    async fn send_egress_frame(
        &self,
        rtp: &mut RtpSession,
        resampler: &mut Resampler,
        frame_16k: &[i16],
        marker: bool,
    ) -> Result<()> {
        let pcm_8k = resampler.downsample_16k_to_8k(frame_16k)?;
        let encoded = self.config.codec.encode_frame(&pcm_8k)?;
        let packet = rtp.packetize(encoded, FRAME_8K as u32, marker);
        let bytes = packet.to_bytes();

        self.socket
            .send_to(&bytes, self.config.remote_addr)
            .await
            .map_err(|e| {
                warn!(error = %e, "RTP send failed");
                Error::Media(format!("RTP send: {}", e))
            })?;

        self.stats.packets_out.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_out
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::{RtpHeader, RtpPacket};

    async fn start_session(
        remote: SocketAddr,
        rtp_timeout: Duration,
    ) -> (Arc<MediaSession>, mpsc::Receiver<MediaOut>) {
        let (tx, rx) = mpsc::channel(64);
        // OS-assigned even-ish ports are fine for tests; bind directly
        let probe = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let config = MediaSessionConfig {
            local_ip: "127.0.0.1".parse().unwrap(),
            ports: PortPair { rtp: port, rtcp: port + 1 },
            remote_addr: remote,
            codec: CodecKind::Pcmu,
            dtmf_payload_type: Some(101),
            jitter_target_ms: 40,
            jitter_max_late_ms: 60,
            rtp_timeout,
        };
        let session = MediaSession::start(config, tx).await.unwrap();
        (session, rx)
    }

    fn pcmu_packet(seq: u16, ssrc: u32) -> Vec<u8> {
        let tone: Vec<u8> = (0..FRAME_8K)
            .map(|n| {
                let s = (8_000.0
                    * (2.0 * std::f32::consts::PI * 440.0 * n as f32 / 8_000.0).sin())
                    as i16;
                crate::codec::linear_to_ulaw(s)
            })
            .collect();
        RtpPacket {
            header: RtpHeader::new(0, seq, seq as u32 * 160, ssrc, seq == 0),
            payload: tone,
        }
        .to_bytes()
    }

    #[tokio::test]
    async fn test_ingress_produces_16k_frames() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (session, mut rx) = start_session(peer.local_addr().unwrap(), Duration::from_secs(30)).await;

        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), session.local_rtp_port());
        for seq in 0..3u16 {
            peer.send_to(&pcmu_packet(seq, 7777), target).await.unwrap();
        }

        // The playout tick runs every 20 ms; collect the first audio frame
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = rx.recv() => match event.unwrap() {
                    MediaOut::Audio16k(frame) => {
                        assert_eq!(frame.len(), FRAME_16K);
                        break;
                    }
                    _ => continue,
                },
                _ = &mut deadline => panic!("no audio frame within deadline"),
            }
        }

        let stats = session.stats();
        assert!(stats.rtp.packets_in >= 1);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_egress_packetizes_queued_audio() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (session, _rx) = start_session(peer.local_addr().unwrap(), Duration::from_secs(30)).await;

        // Two frames of 16 kHz audio
        let pcm: Vec<i16> = (0..FRAME_16K * 2)
            .map(|n| (4_000.0 * (2.0 * std::f32::consts::PI * 440.0 * n as f32 / 16_000.0).sin()) as i16)
            .collect();
        session.push_egress_pcm16_16k(&pcm);

        let mut buf = vec![0u8; 2048];
        let (size, _) = tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .expect("expected egress RTP")
            .unwrap();

        let packet = RtpPacket::parse(&buf[..size]).unwrap();
        assert_eq!(packet.header.payload_type, 0);
        assert_eq!(packet.payload.len(), FRAME_8K);
        assert!(packet.header.marker);

        // Second packet continues the sequence
        let (size2, _) = tokio::time::timeout(Duration::from_millis(500), peer.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let second = RtpPacket::parse(&buf[..size2]).unwrap();
        assert_eq!(
            second.header.sequence,
            packet.header.sequence.wrapping_add(1)
        );
        assert_eq!(
            second.header.timestamp,
            packet.header.timestamp.wrapping_add(FRAME_8K as u32)
        );
        assert!(!second.header.marker);

        assert!(session.stats().rtp.packets_out >= 2);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_rfc2833_event_surfaces_once() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (session, mut rx) = start_session(peer.local_addr().unwrap(), Duration::from_secs(30)).await;
        let target = SocketAddr::new("127.0.0.1".parse().unwrap(), session.local_rtp_port());

        // digit 5, end bit set, duration 160 samples; retransmitted 3 times
        let payload = vec![5u8, 0x8A, 0x00, 0xA0];
        for i in 0..3u16 {
            let pkt = RtpPacket {
                header: RtpHeader::new(101, 100 + i, 5000, 7777, i == 0),
                payload: payload.clone(),
            };
            peer.send_to(&pkt.to_bytes(), target).await.unwrap();
        }

        let mut digits = Vec::new();
        let deadline = tokio::time::sleep(Duration::from_millis(300));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                event = rx.recv() => {
                    if let Some(MediaOut::Dtmf(e)) = event {
                        digits.push(e);
                    }
                }
                _ = &mut deadline => break,
            }
        }

        assert_eq!(digits.len(), 1);
        assert_eq!(digits[0].digit.as_char(), '5');
        assert_eq!(digits[0].duration_ms, 20);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_no_media_watchdog_fires() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (session, mut rx) =
            start_session(peer.local_addr().unwrap(), Duration::from_millis(100)).await;

        let event = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match rx.recv().await {
                    Some(MediaOut::RtpTimeout) => break true,
                    Some(_) => continue,
                    None => break false,
                }
            }
        })
        .await
        .unwrap();
        assert!(event);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_egress_queue_bounded_drop_oldest() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let (session, _rx) = start_session(peer.local_addr().unwrap(), Duration::from_secs(30)).await;

        // Push 15 frames at once; the bound is 10
        let big: Vec<i16> = vec![1; FRAME_16K * 15];
        session.push_egress_pcm16_16k(&big);

        assert_eq!(session.stats().egress_overflow, 5);
        session.stop().await;
    }
}
