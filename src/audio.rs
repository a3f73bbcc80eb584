//! Waveform assembly: silence synthesis, ordered concatenation and the
//! float → 16-bit conversion shared by every codec.

use anyhow::{bail, Result};
use tracing::warn;

/// Contiguous mono PCM at one sample rate.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl AudioBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// `sample_count / sample_rate`, in seconds.
    pub fn duration_secs(&self) -> f64 {
        duration_secs(self.samples.len(), self.sample_rate)
    }
}

pub fn duration_secs(sample_count: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    sample_count as f64 / sample_rate as f64
}

/// Number of samples in `duration_ms` of audio (floor).
pub fn silence_len(duration_ms: u32, sample_rate: u32) -> usize {
    (duration_ms as u64 * sample_rate as u64 / 1_000) as usize
}

/// `duration_ms` of digital silence.
pub fn silence(duration_ms: u32, sample_rate: u32) -> Vec<f32> {
    vec![0.0; silence_len(duration_ms, sample_rate)]
}

// ─────────────────────────────────────────────────────────────────────────────
// Assembler
// ─────────────────────────────────────────────────────────────────────────────

/// Appends chunk waveforms and silences in plan order.
///
/// Every piece must share the session sample rate.
#[derive(Debug)]
pub struct Assembler {
    buffer: AudioBuffer,
    pieces: usize,
}

impl Assembler {
    pub fn new(sample_rate: u32) -> Self {
        Self { buffer: AudioBuffer::new(Vec::new(), sample_rate), pieces: 0 }
    }

    pub fn sample_rate(&self) -> u32 {
        self.buffer.sample_rate
    }

    pub fn push_chunk(&mut self, samples: &[f32], sample_rate: u32) -> Result<()> {
        if sample_rate != self.buffer.sample_rate {
            bail!(
                "sample rate mismatch: piece {} is {} Hz, session is {} Hz",
                self.pieces,
                sample_rate,
                self.buffer.sample_rate
            );
        }
        self.buffer.samples.extend_from_slice(samples);
        self.pieces += 1;
        Ok(())
    }

    pub fn push_silence(&mut self, duration_ms: u32) {
        let n = silence_len(duration_ms, self.buffer.sample_rate);
        self.buffer.samples.resize(self.buffer.samples.len() + n, 0.0);
        self.pieces += 1;
    }

    /// Pieces appended so far.
    pub fn pieces(&self) -> usize {
        self.pieces
    }

    pub fn finish(self) -> AudioBuffer {
        self.buffer
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bit-depth reduction
// ─────────────────────────────────────────────────────────────────────────────

/// Convert float samples to signed 16-bit.
///
/// A buffer whose peak exceeds 1.0 is scaled down to unit peak first; every
/// sample is then clamped to [-1, 1] (NaN becomes 0) before scaling.
pub fn to_pcm16(samples: &[f32]) -> Vec<i16> {
    let peak = samples
        .iter()
        .filter(|s| s.is_finite())
        .fold(0.0f32, |m, s| m.max(s.abs()));
    let gain = if peak > 1.0 {
        warn!(peak, "audio exceeds full scale, normalising");
        1.0 / peak
    } else {
        1.0
    };
    samples
        .iter()
        .map(|&s| {
            let s = if s.is_nan() { 0.0 } else { (s * gain).clamp(-1.0, 1.0) };
            (s * i16::MAX as f32) as i16
        })
        .collect()
}
