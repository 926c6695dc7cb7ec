// DTMF detection: RFC 4733 telephone-event and in-band Goertzel

use serde::Serialize;

use crate::codec::FRAME_8K;

const LOW_FREQS: [f32; 4] = [697.0, 770.0, 852.0, 941.0];
const HIGH_FREQS: [f32; 4] = [1209.0, 1336.0, 1477.0, 1633.0];
const SAMPLE_RATE: f32 = 8000.0;

/// Frames a tone must persist before it counts (40 ms).
const MIN_TONE_FRAMES: u32 = 2;
/// Frames of silence required between digits (40 ms).
const MIN_GAP_FRAMES: u32 = 2;
/// Second-strongest tone in a group must sit at least this far down (-6 dB
/// in power terms).
const TWIST_RATIO: f32 = 0.25;
/// Absolute floor below which a frame is treated as silence.
const MIN_GROUP_ENERGY: f32 = 1.0e7;
/// Tone energy must exceed the tracked noise floor by this factor.
const NOISE_FLOOR_FACTOR: f32 = 8.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DtmfDigit(pub char);

impl DtmfDigit {
    /// RFC 4733 event codes 0-15.
    pub fn from_event_code(code: u8) -> Option<Self> {
        let c = match code {
            0..=9 => (b'0' + code) as char,
            10 => '*',
            11 => '#',
            12..=15 => (b'A' + code - 12) as char,
            _ => return None,
        };
        Some(DtmfDigit(c))
    }

    fn from_tone_pair(low: usize, high: usize) -> Self {
        const MATRIX: [[char; 4]; 4] = [
            ['1', '2', '3', 'A'],
            ['4', '5', '6', 'B'],
            ['7', '8', '9', 'C'],
            ['*', '0', '#', 'D'],
        ];
        DtmfDigit(MATRIX[low][high])
    }

    pub fn as_char(&self) -> char {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DtmfMethod {
    Rfc2833,
    Inband,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DtmfEvent {
    pub digit: DtmfDigit,
    pub duration_ms: u32,
    pub method: DtmfMethod,
}

// RFC 4733 telephone-event decoder. One event per press: emitted on the
// end bit, or when a new event code replaces an unfinished one.
#[derive(Debug, Default)]
pub struct Rfc2833Decoder {
    active: Option<ActiveEvent>,
    last_emitted: Option<(u8, u32)>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveEvent {
    code: u8,
    start_timestamp: u32,
    duration: u16,
}

impl Rfc2833Decoder {
    pub fn new() -> Self {
        Rfc2833Decoder::default()
    }

    /// Feed one telephone-event payload. `rtp_timestamp` identifies the
    /// press; end-bit retransmissions carry the same one and are suppressed.
    pub fn on_payload(&mut self, payload: &[u8], rtp_timestamp: u32) -> Option<DtmfEvent> {
        if payload.len() < 4 {
            return None;
        }
        let code = payload[0];
        let end = payload[1] & 0x80 != 0;
        let duration = u16::from_be_bytes([payload[2], payload[3]]);
        DtmfDigit::from_event_code(code)?;

        match self.active {
            None => {
                if end {
                    // Entire press arrived as a single end packet
                    return self.emit(code, rtp_timestamp, duration);
                }
                self.active = Some(ActiveEvent {
                    code,
                    start_timestamp: rtp_timestamp,
                    duration,
                });
                None
            }
            Some(active) if active.code == code && active.start_timestamp == rtp_timestamp => {
                if end {
                    self.active = None;
                    return self.emit(code, rtp_timestamp, duration.max(active.duration));
                }
                self.active = Some(ActiveEvent {
                    duration: duration.max(active.duration),
                    ..active
                });
                None
            }
            Some(active) => {
                // A different press started before the previous end arrived
                let interrupted = self.emit(active.code, active.start_timestamp, active.duration);
                if end {
                    self.active = None;
                    // The interrupted event wins the return slot; the common
                    // case has no overlap at all
                    return interrupted.or(self.emit(code, rtp_timestamp, duration));
                }
                self.active = Some(ActiveEvent {
                    code,
                    start_timestamp: rtp_timestamp,
                    duration,
                });
                interrupted
            }
        }
    }

    fn emit(&mut self, code: u8, start_timestamp: u32, duration: u16) -> Option<DtmfEvent> {
        if self.last_emitted == Some((code, start_timestamp)) {
            return None;
        }
        self.last_emitted = Some((code, start_timestamp));
        Some(DtmfEvent {
            digit: DtmfDigit::from_event_code(code)?,
            duration_ms: (duration as u32) / 8,
            method: DtmfMethod::Rfc2833,
        })
    }
}

// In-band detector: Goertzel responses at the eight DTMF frequencies per
// 20 ms frame, with twist and persistence checks.
pub struct GoertzelDetector {
    low_coeffs: [f32; 4],
    high_coeffs: [f32; 4],
    window: Vec<f32>,
    noise_floor: f32,
    current: Option<DtmfDigit>,
    tone_frames: u32,
    gap_frames: u32,
    reported: bool,
}

impl Default for GoertzelDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl GoertzelDetector {
    pub fn new() -> Self {
        let coeff = |freq: f32| {
            let k = (0.5 + FRAME_8K as f32 * freq / SAMPLE_RATE).floor();
            2.0 * (2.0 * std::f32::consts::PI * k / FRAME_8K as f32).cos()
        };
        let window = (0..FRAME_8K)
            .map(|n| {
                // Hann window keeps neighbor-tone leakage below the twist check
                0.5 - 0.5
                    * (2.0 * std::f32::consts::PI * n as f32 / (FRAME_8K - 1) as f32).cos()
            })
            .collect();
        GoertzelDetector {
            low_coeffs: LOW_FREQS.map(coeff),
            high_coeffs: HIGH_FREQS.map(coeff),
            window,
            noise_floor: MIN_GROUP_ENERGY,
            current: None,
            tone_frames: 0,
            gap_frames: MIN_GAP_FRAMES,
            reported: false,
        }
    }

    /// Feed one 20 ms 8 kHz frame; returns a digit when the press completes
    /// the persistence requirement.
    pub fn process_frame(&mut self, pcm: &[i16]) -> Option<DtmfEvent> {
        if pcm.len() != FRAME_8K {
            return None;
        }

        let windowed: Vec<f32> = pcm
            .iter()
            .zip(self.window.iter())
            .map(|(&s, &w)| s as f32 * w)
            .collect();

        let low: Vec<f32> = self.low_coeffs.iter().map(|&c| goertzel(&windowed, c)).collect();
        let high: Vec<f32> = self.high_coeffs.iter().map(|&c| goertzel(&windowed, c)).collect();

        let detected = self.frame_digit(&low, &high);

        match (self.current, detected) {
            (None, Some(digit)) => {
                if self.gap_frames >= MIN_GAP_FRAMES {
                    self.current = Some(digit);
                    self.tone_frames = 1;
                    self.reported = false;
                }
                None
            }
            (Some(active), Some(digit)) if active == digit => {
                self.tone_frames += 1;
                if self.tone_frames == MIN_TONE_FRAMES && !self.reported {
                    self.reported = true;
                    Some(DtmfEvent {
                        digit: active,
                        duration_ms: self.tone_frames * 20,
                        method: DtmfMethod::Inband,
                    })
                } else {
                    None
                }
            }
            (Some(_), Some(digit)) => {
                // Tone switched without a gap; restart persistence on the
                // new digit but honor the debounce
                self.current = Some(digit);
                self.tone_frames = 1;
                self.reported = false;
                self.gap_frames = 0;
                None
            }
            (Some(_), None) => {
                self.current = None;
                self.tone_frames = 0;
                self.gap_frames = 1;
                None
            }
            (None, None) => {
                self.gap_frames = self.gap_frames.saturating_add(1);
                None
            }
        }
    }

    fn frame_digit(&mut self, low: &[f32], high: &[f32]) -> Option<DtmfDigit> {
        let (low_idx, low_peak) = peak(low);
        let (high_idx, high_peak) = peak(high);

        let frame_energy: f32 = low.iter().chain(high.iter()).sum();
        let threshold = (self.noise_floor * NOISE_FLOOR_FACTOR).max(MIN_GROUP_ENERGY);

        let tonal = low_peak > threshold && high_peak > threshold;
        if !tonal {
            // Track the ambient level only while no tone is present
            self.noise_floor = 0.9 * self.noise_floor + 0.1 * (frame_energy / 8.0).max(1.0);
            return None;
        }

        // Twist: runner-up in each group must be at least 6 dB down
        for (values, peak_idx, peak_val) in
            [(low, low_idx, low_peak), (high, high_idx, high_peak)]
        {
            for (i, &v) in values.iter().enumerate() {
                if i != peak_idx && v > peak_val * TWIST_RATIO {
                    return None;
                }
            }
        }

        Some(DtmfDigit::from_tone_pair(low_idx, high_idx))
    }
}

fn goertzel(samples: &[f32], coeff: f32) -> f32 {
    let mut s_prev = 0.0f32;
    let mut s_prev2 = 0.0f32;
    for &sample in samples {
        let s = sample + coeff * s_prev - s_prev2;
        s_prev2 = s_prev;
        s_prev = s;
    }
    s_prev2 * s_prev2 + s_prev * s_prev - coeff * s_prev * s_prev2
}

fn peak(values: &[f32]) -> (usize, f32) {
    values
        .iter()
        .copied()
        .enumerate()
        .fold((0, f32::MIN), |best, (i, v)| if v > best.1 { (i, v) } else { best })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_code_mapping() {
        assert_eq!(DtmfDigit::from_event_code(0), Some(DtmfDigit('0')));
        assert_eq!(DtmfDigit::from_event_code(5), Some(DtmfDigit('5')));
        assert_eq!(DtmfDigit::from_event_code(10), Some(DtmfDigit('*')));
        assert_eq!(DtmfDigit::from_event_code(11), Some(DtmfDigit('#')));
        assert_eq!(DtmfDigit::from_event_code(12), Some(DtmfDigit('A')));
        assert_eq!(DtmfDigit::from_event_code(15), Some(DtmfDigit('D')));
        assert_eq!(DtmfDigit::from_event_code(16), None);
    }

    fn event_payload(code: u8, end: bool, duration: u16) -> Vec<u8> {
        let flags = if end { 0x8A } else { 0x0A };
        let d = duration.to_be_bytes();
        vec![code, flags, d[0], d[1]]
    }

    #[test]
    fn test_rfc2833_emits_once_on_end() {
        let mut decoder = Rfc2833Decoder::new();

        // Press of digit 5: start packets then the end packet
        assert!(decoder.on_payload(&event_payload(5, false, 160), 1000).is_none());
        assert!(decoder.on_payload(&event_payload(5, false, 320), 1000).is_none());
        let event = decoder.on_payload(&event_payload(5, true, 160), 1000);
        assert_eq!(
            event,
            Some(DtmfEvent {
                digit: DtmfDigit('5'),
                duration_ms: 40,
                method: DtmfMethod::Rfc2833,
            })
        );

        // End-bit retransmissions of the same press are suppressed
        assert!(decoder.on_payload(&event_payload(5, true, 160), 1000).is_none());
        assert!(decoder.on_payload(&event_payload(5, true, 160), 1000).is_none());
    }

    #[test]
    fn test_rfc2833_single_end_packet() {
        // duration 160 samples at 8 kHz = 20 ms
        let mut decoder = Rfc2833Decoder::new();
        let event = decoder.on_payload(&event_payload(5, true, 160), 4000).unwrap();
        assert_eq!(event.digit, DtmfDigit('5'));
        assert_eq!(event.duration_ms, 20);
    }

    #[test]
    fn test_rfc2833_new_event_flushes_previous() {
        let mut decoder = Rfc2833Decoder::new();
        assert!(decoder.on_payload(&event_payload(1, false, 160), 1000).is_none());
        // The end of press 1 never arrives; press 2 starts
        let flushed = decoder.on_payload(&event_payload(2, false, 160), 3000).unwrap();
        assert_eq!(flushed.digit, DtmfDigit('1'));
        let event = decoder.on_payload(&event_payload(2, true, 480), 3000).unwrap();
        assert_eq!(event.digit, DtmfDigit('2'));
    }

    #[test]
    fn test_rfc2833_distinct_presses_same_digit() {
        let mut decoder = Rfc2833Decoder::new();
        let first = decoder.on_payload(&event_payload(7, true, 160), 1000);
        // Same digit pressed again later: new start timestamp, new event
        let second = decoder.on_payload(&event_payload(7, true, 160), 9000);
        assert!(first.is_some());
        assert!(second.is_some());
    }

    fn dtmf_frame(low: f32, high: f32, amp: f32) -> Vec<i16> {
        (0..FRAME_8K)
            .map(|n| {
                let t = n as f32 / SAMPLE_RATE;
                let s = amp
                    * ((2.0 * std::f32::consts::PI * low * t).sin()
                        + (2.0 * std::f32::consts::PI * high * t).sin())
                    / 2.0;
                s as i16
            })
            .collect()
    }

    fn silence() -> Vec<i16> {
        vec![0i16; FRAME_8K]
    }

    #[test]
    fn test_goertzel_detects_digit_five() {
        // 5 = 770 Hz + 1336 Hz
        let mut detector = GoertzelDetector::new();
        let frame = dtmf_frame(770.0, 1336.0, 12_000.0);

        assert!(detector.process_frame(&frame).is_none());
        let event = detector.process_frame(&frame).expect("digit after 40 ms");
        assert_eq!(event.digit, DtmfDigit('5'));
        assert_eq!(event.method, DtmfMethod::Inband);

        // Continuing the same press emits nothing further
        assert!(detector.process_frame(&frame).is_none());
    }

    #[test]
    fn test_goertzel_ignores_silence_and_speechlike_noise() {
        let mut detector = GoertzelDetector::new();
        assert!(detector.process_frame(&silence()).is_none());

        // A lone tone activates only one group
        let single = (0..FRAME_8K)
            .map(|n| (10_000.0 * (2.0 * std::f32::consts::PI * 697.0 * n as f32 / SAMPLE_RATE).sin()) as i16)
            .collect::<Vec<_>>();
        for _ in 0..4 {
            assert!(detector.process_frame(&single).is_none());
        }
    }

    #[test]
    fn test_goertzel_debounce_between_presses() {
        let mut detector = GoertzelDetector::new();
        let frame = dtmf_frame(697.0, 1209.0, 12_000.0);

        detector.process_frame(&frame);
        assert!(detector.process_frame(&frame).is_some());

        // One frame of gap is under the 40 ms debounce; the new press must
        // not register yet
        detector.process_frame(&silence());
        assert!(detector.process_frame(&frame).is_none());
        assert!(detector.process_frame(&frame).is_none());

        // With a full gap the next press is accepted
        let mut detector = GoertzelDetector::new();
        detector.process_frame(&frame);
        assert!(detector.process_frame(&frame).is_some());
        detector.process_frame(&silence());
        detector.process_frame(&silence());
        detector.process_frame(&frame);
        assert!(detector.process_frame(&frame).is_some());
    }

    #[test]
    fn test_goertzel_twist_rejection() {
        // Two low-group tones at similar level cannot be a valid digit
        let mut detector = GoertzelDetector::new();
        let frame: Vec<i16> = (0..FRAME_8K)
            .map(|n| {
                let t = n as f32 / SAMPLE_RATE;
                let s = 8_000.0
                    * ((2.0 * std::f32::consts::PI * 697.0 * t).sin()
                        + (2.0 * std::f32::consts::PI * 770.0 * t).sin()
                        + (2.0 * std::f32::consts::PI * 1209.0 * t).sin())
                    / 3.0;
                s as i16
            })
            .collect();
        for _ in 0..4 {
            assert!(detector.process_frame(&frame).is_none());
        }
    }
}
