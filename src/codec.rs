// G.711 codecs and the 8/16 kHz resampler

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Samples per 20 ms frame at 8 kHz.
pub const FRAME_8K: usize = 160;
/// Samples per 20 ms frame at 16 kHz.
pub const FRAME_16K: usize = 320;
/// Packetization time in milliseconds.
pub const PTIME_MS: u32 = 20;

const ULAW_BIAS: i32 = 0x84;
const ULAW_CLIP: i32 = 32_635;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodecKind {
    Pcmu,
    Pcma,
}

impl CodecKind {
    pub fn payload_type(&self) -> u8 {
        match self {
            CodecKind::Pcmu => 0,
            CodecKind::Pcma => 8,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodecKind::Pcmu => "PCMU",
            CodecKind::Pcma => "PCMA",
        }
    }

    pub fn from_payload_type(pt: u8) -> Option<Self> {
        match pt {
            0 => Some(CodecKind::Pcmu),
            8 => Some(CodecKind::Pcma),
            _ => None,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_uppercase().as_str() {
            "PCMU" | "G711U" => Some(CodecKind::Pcmu),
            "PCMA" | "G711A" => Some(CodecKind::Pcma),
            _ => None,
        }
    }

    pub fn encode_sample(&self, pcm: i16) -> u8 {
        match self {
            CodecKind::Pcmu => linear_to_ulaw(pcm),
            CodecKind::Pcma => linear_to_alaw(pcm),
        }
    }

    pub fn decode_sample(&self, code: u8) -> i16 {
        match self {
            CodecKind::Pcmu => ULAW_DECODE[code as usize],
            CodecKind::Pcma => ALAW_DECODE[code as usize],
        }
    }

    /// Encode one 20 ms 8 kHz frame.
    pub fn encode_frame(&self, pcm: &[i16]) -> Result<Vec<u8>> {
        check_frame(pcm.len(), FRAME_8K)?;
        Ok(pcm.iter().map(|&s| self.encode_sample(s)).collect())
    }

    /// Decode one 20 ms 8 kHz frame.
    pub fn decode_frame(&self, data: &[u8]) -> Result<Vec<i16>> {
        check_frame(data.len(), FRAME_8K)?;
        Ok(data.iter().map(|&c| self.decode_sample(c)).collect())
    }
}

fn check_frame(got: usize, expected: usize) -> Result<()> {
    if got != expected {
        return Err(Error::InvalidFrameSize { expected, got });
    }
    Ok(())
}

// Segment boundaries for the eight mu-law chords
const ULAW_SEG_END: [i32; 8] = [0xFF, 0x1FF, 0x3FF, 0x7FF, 0xFFF, 0x1FFF, 0x3FFF, 0x7FFF];

pub fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let mask: u8;
    if pcm < 0 {
        pcm = ULAW_BIAS - pcm;
        mask = 0x7F;
    } else {
        pcm += ULAW_BIAS;
        mask = 0xFF;
    }
    if pcm > ULAW_CLIP + ULAW_BIAS {
        pcm = ULAW_CLIP + ULAW_BIAS;
    }

    let seg = ULAW_SEG_END.iter().position(|&end| pcm <= end).unwrap_or(8);
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let uval = ((seg as i32) << 4) | ((pcm >> (seg + 3)) & 0x0F);
    (uval as u8) ^ mask
}

pub fn ulaw_to_linear(code: u8) -> i16 {
    let u = !code;
    let mut t = (((u & 0x0F) as i32) << 3) + ULAW_BIAS;
    t <<= (u & 0x70) >> 4;
    if u & 0x80 != 0 {
        (ULAW_BIAS - t) as i16
    } else {
        (t - ULAW_BIAS) as i16
    }
}

const ALAW_AMI_MASK: u8 = 0x55;

pub fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = sample as i32;
    let mask: u8;
    if pcm >= 0 {
        mask = ALAW_AMI_MASK | 0x80;
    } else {
        mask = ALAW_AMI_MASK;
        pcm = -pcm - 1;
    }

    // Segment = index of the magnitude's top bit, floored at bit 7
    let seg = 24 - (pcm | 0xFF).leading_zeros() as i32;
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let shift = if seg > 0 { seg + 3 } else { 4 };
    let aval = ((seg << 4) | ((pcm >> shift) & 0x0F)) as u8;
    aval ^ mask
}

pub fn alaw_to_linear(code: u8) -> i16 {
    let a = code ^ ALAW_AMI_MASK;
    let mut t = ((a & 0x0F) as i32) << 4;
    let seg = ((a & 0x70) >> 4) as i32;
    match seg {
        0 => t += 8,
        _ => t = (t + 0x108) << (seg - 1),
    }
    if a & 0x80 != 0 {
        t as i16
    } else {
        -t as i16
    }
}

static ULAW_DECODE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (code, slot) in table.iter_mut().enumerate() {
        *slot = ulaw_to_linear(code as u8);
    }
    table
});

static ALAW_DECODE: Lazy<[i16; 256]> = Lazy::new(|| {
    let mut table = [0i16; 256];
    for (code, slot) in table.iter_mut().enumerate() {
        *slot = alaw_to_linear(code as u8);
    }
    table
});

// Resampler: 2x up/down through a linear-phase FIR, passband flat to
// 3.4 kHz, stopband past 4 kHz. The filter state persists across frames so
// consecutive 20 ms frames join without a phase reset.

/// Tap count for the anti-alias/anti-image lowpass (odd, linear phase).
const FIR_TAPS: usize = 47;
/// Cutoff placed between the 3.4 kHz passband edge and the 4 kHz image edge.
const FIR_CUTOFF_HZ: f64 = 3_700.0;
const FIR_RATE_HZ: f64 = 16_000.0;

fn lowpass_taps(gain: f64) -> Vec<f32> {
    let m = (FIR_TAPS - 1) as f64 / 2.0;
    let fc = FIR_CUTOFF_HZ / FIR_RATE_HZ;
    (0..FIR_TAPS)
        .map(|n| {
            let x = n as f64 - m;
            let sinc = if x == 0.0 {
                2.0 * fc
            } else {
                (2.0 * std::f64::consts::PI * fc * x).sin() / (std::f64::consts::PI * x)
            };
            // Hamming window
            let w = 0.54
                - 0.46 * (2.0 * std::f64::consts::PI * n as f64 / (FIR_TAPS - 1) as f64).cos();
            (sinc * w * gain) as f32
        })
        .collect()
}

struct Fir {
    taps: Vec<f32>,
    history: Vec<f32>,
}

impl Fir {
    fn new(taps: Vec<f32>) -> Self {
        let len = taps.len();
        Fir {
            taps,
            history: vec![0.0; len - 1],
        }
    }

    fn process(&mut self, input: &[f32]) -> Vec<f32> {
        let n = self.taps.len();
        let mut buffer = Vec::with_capacity(self.history.len() + input.len());
        buffer.extend_from_slice(&self.history);
        buffer.extend_from_slice(input);

        let mut out = Vec::with_capacity(input.len());
        for i in 0..input.len() {
            let window = &buffer[i..i + n];
            let mut acc = 0.0f32;
            for (sample, tap) in window.iter().zip(self.taps.iter().rev()) {
                acc += sample * tap;
            }
            out.push(acc);
        }

        self.history.clear();
        self.history.extend_from_slice(&buffer[buffer.len() - (n - 1)..]);
        out
    }

    fn reset(&mut self) {
        self.history.iter_mut().for_each(|s| *s = 0.0);
    }
}

pub struct Resampler {
    up: Fir,
    down: Fir,
}

impl Default for Resampler {
    fn default() -> Self {
        Self::new()
    }
}

impl Resampler {
    pub fn new() -> Self {
        Resampler {
            // Zero stuffing halves the energy; the interpolator makes it up
            up: Fir::new(lowpass_taps(2.0)),
            down: Fir::new(lowpass_taps(1.0)),
        }
    }

    /// 20 ms at 8 kHz (160 samples) to 20 ms at 16 kHz (320 samples).
    pub fn upsample_8k_to_16k(&mut self, input: &[i16]) -> Result<Vec<i16>> {
        check_frame(input.len(), FRAME_8K)?;

        let mut stuffed = vec![0.0f32; input.len() * 2];
        for (i, &s) in input.iter().enumerate() {
            stuffed[i * 2] = s as f32;
        }
        let filtered = self.up.process(&stuffed);
        Ok(filtered.iter().map(|&s| clamp_i16(s)).collect())
    }

    /// 20 ms at 16 kHz (320 samples) to 20 ms at 8 kHz (160 samples).
    pub fn downsample_16k_to_8k(&mut self, input: &[i16]) -> Result<Vec<i16>> {
        check_frame(input.len(), FRAME_16K)?;

        let as_f32: Vec<f32> = input.iter().map(|&s| s as f32).collect();
        let filtered = self.down.process(&as_f32);
        Ok(filtered.iter().step_by(2).map(|&s| clamp_i16(s)).collect())
    }

    pub fn reset(&mut self) {
        self.up.reset();
        self.down.reset();
    }
}

fn clamp_i16(s: f32) -> i16 {
    s.round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}
