//! Inference-engine contract and the built-in synthetic backend.
//!
//! The generative model is opaque to the orchestration layer.  It is reached
//! through two traits:
//!
//! * [`EngineBackend`]: knows the host (which devices and attention kernels
//!   exist) and constructs engines for a [`ResolvedConfig`].
//! * [`SpeechEngine`]: one loaded model.  Not reentrant: every method takes
//!   `&mut self`, and the lifecycle manager hands out at most one lease.
//!
//! Every engine call receives an explicit [`StdRng`]; engines must draw all
//! of their randomness from it so that a fixed seed reproduces a chunk.

use std::io::Cursor;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::device::{Attention, Device, Quantization, ResolvedConfig};
use crate::script::speaker_ids;

/// Sample rate of the synthetic backend and of the default settings.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

// ─────────────────────────────────────────────────────────────────────────────
// Generation inputs
// ─────────────────────────────────────────────────────────────────────────────

/// Reference waveform for one speaker (mono PCM floats).
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSample {
    pub speaker: usize,
    pub samples: Arc<[f32]>,
    pub sample_rate: u32,
}

impl VoiceSample {
    pub fn new(speaker: usize, samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { speaker, samples: samples.into(), sample_rate }
    }

    /// Deterministic stand-in voice: a one-second formant tone whose pitch
    /// depends on the speaker index.
    pub fn synthetic(speaker: usize, sample_rate: u32) -> Self {
        let base = 110.0 + 35.0 * (speaker % 8) as f32;
        let formants = [(base, 0.5f32), (base * 2.7, 0.3), (base * 4.1, 0.2)];
        let tau = std::f32::consts::TAU;
        let samples = (0..sample_rate)
            .map(|i| {
                let t = i as f32 / sample_rate as f32;
                let tone: f32 = formants.iter().map(|(f, a)| a * (tau * f * t).sin()).sum();
                // Slow amplitude envelope so the tone is not a flat carrier.
                let envelope = 0.6 + 0.4 * (tau * 3.0 * t).sin();
                0.3 * tone * envelope
            })
            .collect();
        Self::new(speaker, samples, sample_rate)
    }

    /// Decode a WAV file into a mono voice sample at `target_rate`.
    ///
    /// Channels are averaged, the result is linearly resampled and
    /// peak-normalised to 0.95.
    pub fn from_wav_bytes(speaker: usize, bytes: &[u8], target_rate: u32) -> anyhow::Result<Self> {
        let mut reader =
            hound::WavReader::new(Cursor::new(bytes)).context("Cannot parse voice sample WAV")?;
        let spec = reader.spec();
        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .context("Bad float sample in voice WAV")?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.saturating_sub(1))) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .context("Bad integer sample in voice WAV")?
            }
        };
        let channels = spec.channels.max(1) as usize;
        let mono: Vec<f32> = interleaved
            .chunks(channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
            .collect();
        if mono.is_empty() {
            bail!("voice sample for speaker {speaker} is empty");
        }

        let mut samples = resample_linear(&mono, spec.sample_rate, target_rate);
        let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        if peak > 0.0 {
            let gain = 0.95 / peak;
            samples.iter_mut().for_each(|s| *s *= gain);
        }
        Ok(Self::new(speaker, samples, target_rate))
    }

    pub fn duration_secs(&self) -> f32 {
        self.samples.len() as f32 / self.sample_rate as f32
    }

    /// This voice at `rate`; shares the samples when the rate already matches.
    pub fn resampled(&self, rate: u32) -> Self {
        if rate == self.sample_rate {
            return self.clone();
        }
        Self::new(self.speaker, resample_linear(&self.samples, self.sample_rate, rate), rate)
    }
}

fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 {
        return input.to_vec();
    }
    let out_len = ((input.len() as u64 * to as u64) / from as u64).max(1) as usize;
    let step = from as f64 / to as f64;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = pos.floor() as usize;
            let frac = (pos - idx as f64) as f32;
            let a = input[idx.min(input.len() - 1)];
            let b = input[(idx + 1).min(input.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Token-sampling knobs forwarded untouched to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub do_sample: bool,
    pub temperature: f32,
    pub top_p: f32,
    pub top_k: u32,
    pub repetition_penalty: f32,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            do_sample: false,
            temperature: 1.0,
            top_p: 1.0,
            top_k: 50,
            repetition_penalty: 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    /// Classifier-free guidance strength.
    pub guidance_scale: f32,
    /// Diffusion / decode steps.
    pub steps: u32,
    #[serde(default)]
    pub sampling: SamplingParams,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { guidance_scale: 1.3, steps: 10, sampling: SamplingParams::default() }
    }
}

/// Everything one engine call sees.
#[derive(Debug, Clone, Copy)]
pub struct EngineInput<'a> {
    pub text: &'a str,
    pub voices: &'a [VoiceSample],
    pub params: &'a GenerationParams,
}

// ─────────────────────────────────────────────────────────────────────────────
// Traits
// ─────────────────────────────────────────────────────────────────────────────

/// A loaded generative speech model.
pub trait SpeechEngine: Send {
    /// Sample rate of every waveform this engine returns.
    fn sample_rate(&self) -> u32;

    /// Generate the full waveform for one chunk.
    fn generate(&mut self, input: &EngineInput<'_>, rng: &mut StdRng) -> anyhow::Result<Vec<f32>>;

    /// Whether [`generate_incremental`](Self::generate_incremental) yields
    /// more than one piece.
    fn supports_incremental(&self) -> bool {
        false
    }

    /// Generate one chunk, handing decoded pieces to `emit` as they become
    /// ready.  `emit` returning [`ControlFlow::Break`] asks the engine to
    /// stop early; that is not an error.
    fn generate_incremental(
        &mut self,
        input: &EngineInput<'_>,
        rng: &mut StdRng,
        emit: &mut dyn FnMut(Vec<f32>) -> ControlFlow<()>,
    ) -> anyhow::Result<()> {
        let wave = self.generate(input, rng)?;
        let _ = emit(wave);
        Ok(())
    }

    /// Free device memory.  Called exactly once before the engine is dropped.
    fn release(&mut self) {}
}

/// Factory for [`SpeechEngine`]s plus the host capabilities it sees.
pub trait EngineBackend: Send + Sync {
    fn name(&self) -> &str;

    fn device_available(&self, device: Device) -> bool;

    fn attention_available(&self, _attention: Attention, _device: Device) -> bool {
        true
    }

    /// Construct an engine.  Blocking; called off the async runtime.
    fn load(&self, config: &ResolvedConfig) -> anyhow::Result<Box<dyn SpeechEngine>>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthetic backend
// ─────────────────────────────────────────────────────────────────────────────

/// Counters shared between a [`SyntheticBackend`] and the engines it built.
#[derive(Debug, Default)]
pub struct SyntheticStats {
    loads: AtomicUsize,
    releases: AtomicUsize,
    calls: AtomicUsize,
    loading: AtomicUsize,
    peak_loading: AtomicUsize,
}

impl SyntheticStats {
    /// Successful loads so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Engines loaded and not yet released.
    pub fn live(&self) -> usize {
        self.loads().saturating_sub(self.releases())
    }

    /// Engine generate calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Most loads ever running at the same time.
    pub fn peak_concurrent_loads(&self) -> usize {
        self.peak_loading.load(Ordering::SeqCst)
    }
}

/// Deterministic backend that needs no model files.
///
/// Produces a short tone per word whose pitch depends on the word and the
/// speaker label, plus a little noise drawn from the call's RNG.  Knobs make
/// it usable as a test double: restricted devices, failing kernels, slow or
/// failing chunks.
#[derive(Debug, Clone)]
pub struct SyntheticBackend {
    sample_rate: u32,
    devices: Vec<Device>,
    flash_attention: bool,
    failing_kernels: Vec<Attention>,
    failing_quantization: bool,
    chunk_delay: Duration,
    load_delay: Duration,
    fail_on: Option<String>,
    incremental_block: usize,
    stats: Arc<SyntheticStats>,
}

impl SyntheticBackend {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            devices: vec![Device::Cpu],
            flash_attention: true,
            failing_kernels: Vec::new(),
            failing_quantization: false,
            chunk_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            fail_on: None,
            incremental_block: (sample_rate / 5) as usize,
            stats: Arc::default(),
        }
    }

    /// Devices reported as present (CPU is always usable).
    pub fn with_devices(mut self, devices: &[Device]) -> Self {
        self.devices = devices.to_vec();
        self
    }

    /// Report flash-attention kernels as not installed.
    pub fn without_flash_attention(mut self) -> Self {
        self.flash_attention = false;
        self
    }

    /// Make loads with `attention` fail.
    pub fn failing_kernel(mut self, attention: Attention) -> Self {
        self.failing_kernels.push(attention);
        self
    }

    /// Make every quantized load fail.
    pub fn failing_quantization(mut self) -> Self {
        self.failing_quantization = true;
        self
    }

    /// Sleep this long inside every generate call.
    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = delay;
        self
    }

    /// Sleep this long inside every load.
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Fail generation of any chunk containing `needle`.
    pub fn failing_on(mut self, needle: impl Into<String>) -> Self {
        self.fail_on = Some(needle.into());
        self
    }

    pub fn stats(&self) -> Arc<SyntheticStats> {
        Arc::clone(&self.stats)
    }
}

impl EngineBackend for SyntheticBackend {
    fn name(&self) -> &str {
        "synthetic"
    }

    fn device_available(&self, device: Device) -> bool {
        device == Device::Cpu || self.devices.contains(&device)
    }

    fn attention_available(&self, attention: Attention, _device: Device) -> bool {
        attention != Attention::FlashAttention2 || self.flash_attention
    }

    fn load(&self, config: &ResolvedConfig) -> anyhow::Result<Box<dyn SpeechEngine>> {
        if self.failing_kernels.contains(&config.attention) {
            bail!("{} kernels failed to initialise", config.attention);
        }
        if self.failing_quantization && config.quantization != Quantization::None {
            bail!("{} quantization is not supported by this build", config.quantization);
        }
        let running = self.stats.loading.fetch_add(1, Ordering::SeqCst) + 1;
        self.stats.peak_loading.fetch_max(running, Ordering::SeqCst);
        if !self.load_delay.is_zero() {
            std::thread::sleep(self.load_delay);
        }
        self.stats.loading.fetch_sub(1, Ordering::SeqCst);
        self.stats.loads.fetch_add(1, Ordering::SeqCst);
        debug!(model = %config.model_id, attention = %config.attention, "synthetic engine loaded");
        Ok(Box::new(SyntheticEngine {
            sample_rate: self.sample_rate,
            chunk_delay: self.chunk_delay,
            fail_on: self.fail_on.clone(),
            incremental_block: self.incremental_block.max(1),
            stats: Arc::clone(&self.stats),
            released: false,
        }))
    }
}

/// Engine built by [`SyntheticBackend`].
pub struct SyntheticEngine {
    sample_rate: u32,
    chunk_delay: Duration,
    fail_on: Option<String>,
    incremental_block: usize,
    stats: Arc<SyntheticStats>,
    released: bool,
}

impl SyntheticEngine {
    fn render(&self, input: &EngineInput<'_>, rng: &mut StdRng) -> Vec<f32> {
        let per_word = (self.sample_rate / 20) as usize;
        let tau = std::f32::consts::TAU;
        let speaker = speaker_ids(input.text).into_iter().next().unwrap_or(0);
        let voice_shift = input
            .voices
            .iter()
            .find(|v| v.speaker == speaker)
            .map(|v| (v.samples.len() % 40) as f32)
            .unwrap_or(0.0);
        let gain = (0.2 + 0.05 * input.params.guidance_scale).min(0.6);

        let mut out = Vec::new();
        for word in input.text.split_whitespace() {
            let hash = word.bytes().fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
            let freq = 120.0 + 25.0 * speaker as f32 + voice_shift + (hash % 240) as f32;
            for i in 0..per_word {
                let t = i as f32 / self.sample_rate as f32;
                let noise: f32 = rng.gen_range(-0.01..0.01);
                out.push(gain * (tau * freq * t).sin() + noise);
            }
        }
        out
    }

    fn check(&self, input: &EngineInput<'_>) -> anyhow::Result<()> {
        self.stats.calls.fetch_add(1, Ordering::SeqCst);
        if !self.chunk_delay.is_zero() {
            std::thread::sleep(self.chunk_delay);
        }
        if let Some(v) = input.voices.iter().find(|v| v.sample_rate != self.sample_rate) {
            bail!(
                "reference voice for speaker {} is at {} Hz, engine runs at {} Hz",
                v.speaker,
                v.sample_rate,
                self.sample_rate
            );
        }
        if let Some(needle) = &self.fail_on {
            if input.text.contains(needle.as_str()) {
                bail!("synthetic failure on {:?}", input.text);
            }
        }
        Ok(())
    }
}

impl SpeechEngine for SyntheticEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate(&mut self, input: &EngineInput<'_>, rng: &mut StdRng) -> anyhow::Result<Vec<f32>> {
        self.check(input)?;
        Ok(self.render(input, rng))
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    fn generate_incremental(
        &mut self,
        input: &EngineInput<'_>,
        rng: &mut StdRng,
        emit: &mut dyn FnMut(Vec<f32>) -> ControlFlow<()>,
    ) -> anyhow::Result<()> {
        self.check(input)?;
        let wave = self.render(input, rng);
        for block in wave.chunks(self.incremental_block) {
            if emit(block.to_vec()).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            self.stats.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Precision;
    use rand::SeedableRng;

    fn resolved(attention: Attention, quantization: Quantization) -> ResolvedConfig {
        ResolvedConfig {
            model_id: "synthetic".into(),
            device: Device::Cpu,
            precision: Precision::F32,
            attention,
            quantization,
            adapter: None,
        }
    }

    fn input<'a>(text: &'a str, params: &'a GenerationParams) -> EngineInput<'a> {
        EngineInput { text, voices: &[], params }
    }

    #[test]
    fn test_synthetic_is_deterministic_per_seed() {
        let backend = SyntheticBackend::new(16_000);
        let mut engine = backend.load(&resolved(Attention::Sdpa, Quantization::None)).unwrap();
        let params = GenerationParams::default();
        let a = engine.generate(&input("Speaker 0: Hello there", &params), &mut StdRng::seed_from_u64(7)).unwrap();
        let b = engine.generate(&input("Speaker 0: Hello there", &params), &mut StdRng::seed_from_u64(7)).unwrap();
        let c = engine.generate(&input("Speaker 0: Hello there", &params), &mut StdRng::seed_from_u64(8)).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 4 * 800);
    }

    #[test]
    fn test_incremental_matches_full_output() {
        let backend = SyntheticBackend::new(24_000);
        let mut engine = backend.load(&resolved(Attention::Sdpa, Quantization::None)).unwrap();
        let params = GenerationParams::default();
        let text = "one two three four five six seven";
        let full = engine.generate(&input(text, &params), &mut StdRng::seed_from_u64(1)).unwrap();

        let mut pieces = Vec::new();
        engine
            .generate_incremental(&input(text, &params), &mut StdRng::seed_from_u64(1), &mut |p| {
                pieces.push(p);
                ControlFlow::Continue(())
            })
            .unwrap();
        assert!(pieces.len() > 1);
        assert_eq!(pieces.concat(), full);
    }

    #[test]
    fn test_failure_knobs() {
        let backend = SyntheticBackend::new(24_000)
            .failing_kernel(Attention::FlashAttention2)
            .failing_quantization()
            .failing_on("boom");
        assert!(backend.load(&resolved(Attention::FlashAttention2, Quantization::None)).is_err());
        assert!(backend.load(&resolved(Attention::Sdpa, Quantization::Int8)).is_err());

        let mut engine = backend.load(&resolved(Attention::Sdpa, Quantization::None)).unwrap();
        let params = GenerationParams::default();
        let err = engine
            .generate(&input("go boom now", &params), &mut StdRng::seed_from_u64(0))
            .unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_release_counts_once() {
        let backend = SyntheticBackend::new(24_000);
        let stats = backend.stats();
        let mut engine = backend.load(&resolved(Attention::Sdpa, Quantization::None)).unwrap();
        assert_eq!(stats.live(), 1);
        engine.release();
        engine.release();
        assert_eq!(stats.releases(), 1);
        assert_eq!(stats.live(), 0);
    }

    #[test]
    fn test_synthetic_voice_differs_per_speaker() {
        let a = VoiceSample::synthetic(0, 24_000);
        let b = VoiceSample::synthetic(1, 24_000);
        assert_eq!(a.samples.len(), 24_000);
        assert_ne!(a.samples, b.samples);
        assert!(a.samples.iter().all(|s| s.abs() <= 1.0));
    }

    #[test]
    fn test_voice_from_wav_resamples_and_mixes_down() {
        let spec = hound::WavSpec {
            channels: 2,
            sample_rate: 48_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut buf, spec).unwrap();
            for i in 0..4_800i32 {
                let v = ((i % 100) * 100) as i16;
                writer.write_sample(v).unwrap();
                writer.write_sample(v).unwrap();
            }
            writer.finalize().unwrap();
        }
        let voice = VoiceSample::from_wav_bytes(2, buf.get_ref(), 24_000).unwrap();
        assert_eq!(voice.speaker, 2);
        assert_eq!(voice.sample_rate, 24_000);
        assert_eq!(voice.samples.len(), 2_400);
        let peak = voice.samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
        assert!((peak - 0.95).abs() < 1e-3);
    }

    #[test]
    fn test_voice_from_garbage_is_error() {
        assert!(VoiceSample::from_wav_bytes(0, b"not a wav", 24_000).is_err());
    }
}
