//! ONNX Runtime backend for a two-stage exported model.
//!
//! Uses [`ort`] for inference.  The backbone turns a speaker-labelled script
//! plus reference voices into acoustic latents; the decoder turns latents and
//! noise into a waveform.
//!
//! Backbone inputs (positional):
//!
//! | Name            | Shape             | dtype   |
//! |-----------------|-------------------|---------|
//! | `text_bytes`    | `[1, n_bytes]`    | int64   |
//! | `voices`        | `[n_voices, len]` | float32 |
//! | `voice_lengths` | `[n_voices]`      | int64   |
//! | `cfg_scale`     | `[1]`             | float32 |
//!
//! Output 0 is `latents`, `[1, frames, latent_dim]` float32.
//!
//! Decoder inputs (positional):
//!
//! | Name      | Shape                     | dtype   |
//! |-----------|---------------------------|---------|
//! | `latents` | `[1, frames, latent_dim]` | float32 |
//! | `noise`   | `[1, frames, latent_dim]` | float32 |
//! | `steps`   | `[1]`                     | int64   |
//!
//! Output 0 is the waveform (`[1, T]` or `[T]`).

use std::ops::ControlFlow;
use std::path::Path;

use anyhow::{bail, Context, Result};
use ort::{
    ep::{self, ExecutionProvider},
    session::{builder::GraphOptimizationLevel, Session},
    value::Tensor,
};
use rand::rngs::StdRng;
use rand::Rng;
use tracing::{debug, info};

use crate::device::{Attention, Device, ResolvedConfig};
use crate::download::resolve_model;
use crate::engine::{EngineBackend, EngineInput, SpeechEngine, VoiceSample};

/// Latent frames decoded per incremental piece.
const DECODE_WINDOW: usize = 16;

// ─────────────────────────────────────────────────────────────────────────────
// Backend
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct OnnxBackend {
    intra_threads: Option<usize>,
}

impl OnnxBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = Some(threads.max(1));
        self
    }

    fn session(&self, path: &Path, device: Device, attention: Attention) -> Result<Session> {
        // Eager keeps the graph unfused; the other kernels rely on attention fusion.
        let level = match attention {
            Attention::Eager => GraphOptimizationLevel::Level1,
            Attention::Sdpa | Attention::FlashAttention2 => GraphOptimizationLevel::Level3,
        };

        let mut builder = Session::builder()
            .context("Failed to create ORT session builder")?
            .with_optimization_level(level)?;
        if let Some(threads) = self.intra_threads {
            builder = builder.with_intra_threads(threads)?;
        }

        let builder = match device {
            Device::Cuda => builder
                .with_execution_providers([ep::CUDA::default().build().error_on_failure()])
                .context("Failed to enable the CUDA execution provider")?,
            Device::Mps => builder
                .with_execution_providers([ep::CoreML::default().build().error_on_failure()])
                .context("Failed to enable the CoreML execution provider")?,
            Device::Cpu => builder,
        };

        builder
            .commit_from_file(path)
            .with_context(|| format!("Cannot load ONNX model: {}", path.display()))
    }
}

impl EngineBackend for OnnxBackend {
    fn name(&self) -> &str {
        "onnx"
    }

    fn device_available(&self, device: Device) -> bool {
        match device {
            Device::Cpu => true,
            Device::Cuda => ep::CUDA::default().is_available().unwrap_or(false),
            Device::Mps => ep::CoreML::default().is_available().unwrap_or(false),
        }
    }

    fn attention_available(&self, attention: Attention, device: Device) -> bool {
        attention != Attention::FlashAttention2 || device == Device::Cuda
    }

    fn load(&self, config: &ResolvedConfig) -> Result<Box<dyn SpeechEngine>> {
        let files = resolve_model(&config.model_id, config.quantization, config.adapter.as_deref())?;
        let backbone_path = files.adapter.as_ref().unwrap_or(&files.backbone);

        info!(
            model = %config.model_id,
            device = %config.device,
            attention = %config.attention,
            quantization = %config.quantization,
            backbone = %backbone_path.display(),
            "loading onnx sessions"
        );
        let backbone = self.session(backbone_path, config.device, config.attention)?;
        let decoder = self.session(&files.decoder, config.device, config.attention)?;

        if files.manifest.latent_dim == 0 {
            bail!("config.json: latent_dim must be positive");
        }
        Ok(Box::new(OnnxEngine {
            backbone: Some(backbone),
            decoder: Some(decoder),
            sample_rate: files.manifest.sample_rate,
            latent_dim: files.manifest.latent_dim,
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

pub struct OnnxEngine {
    backbone: Option<Session>,
    decoder: Option<Session>,
    sample_rate: u32,
    latent_dim: usize,
}

impl OnnxEngine {
    fn encode(&mut self, input: &EngineInput<'_>) -> Result<Vec<f32>> {
        let backbone = self.backbone.as_mut().context("engine already released")?;

        let ids: Vec<i64> = input.text.bytes().map(i64::from).collect();
        let n_bytes = ids.len();
        let (voices, lengths, width) = pack_voices(input.voices);
        let n_voices = lengths.len();

        let t_ids = Tensor::<i64>::from_array(([1usize, n_bytes], ids))
            .context("Failed to build text_bytes tensor")?;
        let t_voices = Tensor::<f32>::from_array(([n_voices, width], voices))
            .context("Failed to build voices tensor")?;
        let t_lengths = Tensor::<i64>::from_array(([n_voices], lengths))
            .context("Failed to build voice_lengths tensor")?;
        let t_cfg = Tensor::<f32>::from_array(([1usize], vec![input.params.guidance_scale]))
            .context("Failed to build cfg_scale tensor")?;

        let outputs = backbone
            .run(ort::inputs![t_ids, t_voices, t_lengths, t_cfg])
            .context("Backbone inference failed")?;
        let (_shape, latents) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to extract latents")?;

        if latents.len() % self.latent_dim != 0 {
            bail!(
                "backbone returned {} values, not a multiple of latent_dim {}",
                latents.len(),
                self.latent_dim
            );
        }
        Ok(latents.to_vec())
    }

    fn decode(&mut self, latents: &[f32], input: &EngineInput<'_>, rng: &mut StdRng) -> Result<Vec<f32>> {
        let decoder = self.decoder.as_mut().context("engine already released")?;
        let frames = latents.len() / self.latent_dim;

        let sampling = &input.params.sampling;
        let scale = if sampling.do_sample { sampling.temperature } else { 1.0 };
        let noise = gaussian_noise(rng, latents.len(), scale);

        let t_latents = Tensor::<f32>::from_array(([1usize, frames, self.latent_dim], latents.to_vec()))
            .context("Failed to build latents tensor")?;
        let t_noise = Tensor::<f32>::from_array(([1usize, frames, self.latent_dim], noise))
            .context("Failed to build noise tensor")?;
        let t_steps = Tensor::<i64>::from_array(([1usize], vec![i64::from(input.params.steps)]))
            .context("Failed to build steps tensor")?;

        let outputs = decoder
            .run(ort::inputs![t_latents, t_noise, t_steps])
            .context("Decoder inference failed")?;
        let (_shape, audio) = outputs[0]
            .try_extract_tensor::<f32>()
            .context("Failed to extract waveform")?;
        Ok(audio.to_vec())
    }
}

impl SpeechEngine for OnnxEngine {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn generate(&mut self, input: &EngineInput<'_>, rng: &mut StdRng) -> Result<Vec<f32>> {
        let latents = self.encode(input)?;
        if latents.is_empty() {
            return Ok(Vec::new());
        }
        self.decode(&latents, input, rng)
    }

    fn supports_incremental(&self) -> bool {
        true
    }

    fn generate_incremental(
        &mut self,
        input: &EngineInput<'_>,
        rng: &mut StdRng,
        emit: &mut dyn FnMut(Vec<f32>) -> ControlFlow<()>,
    ) -> Result<()> {
        let latents = self.encode(input)?;
        let window = DECODE_WINDOW * self.latent_dim;
        for (i, piece) in latents.chunks(window).enumerate() {
            let wave = self.decode(piece, input, rng)?;
            debug!(window = i, samples = wave.len(), "decoded window");
            if emit(wave).is_break() {
                break;
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        self.backbone = None;
        self.decoder = None;
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tensor helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Zero-padded `[n_voices, width]` matrix plus the real length of each row.
/// An empty voice list becomes one silent row so the graph always sees a
/// non-empty batch.
fn pack_voices(voices: &[VoiceSample]) -> (Vec<f32>, Vec<i64>, usize) {
    if voices.is_empty() {
        return (vec![0.0], vec![1], 1);
    }
    let width = voices.iter().map(|v| v.samples.len()).max().unwrap_or(0).max(1);
    let mut flat = vec![0.0f32; voices.len() * width];
    let mut lengths = Vec::with_capacity(voices.len());
    for (row, voice) in flat.chunks_mut(width).zip(voices) {
        row[..voice.samples.len()].copy_from_slice(&voice.samples);
        lengths.push(voice.samples.len() as i64);
    }
    (flat, lengths, width)
}

/// Standard-normal noise via Box–Muller, scaled by `scale`.
fn gaussian_noise(rng: &mut StdRng, len: usize, scale: f32) -> Vec<f32> {
    let tau = std::f32::consts::TAU;
    let mut out = Vec::with_capacity(len + 1);
    while out.len() < len {
        let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
        let u2: f32 = rng.gen();
        let r = (-2.0 * u1.ln()).sqrt();
        out.push(scale * r * (tau * u2).cos());
        out.push(scale * r * (tau * u2).sin());
    }
    out.truncate(len);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    #[test]
    fn test_pack_voices_pads_rows() {
        let voices = vec![
            VoiceSample::new(0, vec![0.1, 0.2, 0.3], 24_000),
            VoiceSample::new(1, vec![0.5], 24_000),
        ];
        let (flat, lengths, width) = pack_voices(&voices);
        assert_eq!(width, 3);
        assert_eq!(lengths, vec![3, 1]);
        assert_eq!(flat, vec![0.1, 0.2, 0.3, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_pack_voices_empty() {
        let (flat, lengths, width) = pack_voices(&[]);
        assert_eq!((flat.len(), lengths.len(), width), (1, 1, 1));
    }

    #[test]
    fn test_noise_is_seeded() {
        let a = gaussian_noise(&mut StdRng::seed_from_u64(3), 7, 1.0);
        let b = gaussian_noise(&mut StdRng::seed_from_u64(3), 7, 1.0);
        assert_eq!(a.len(), 7);
        assert_eq!(a, b);
        assert!(a.iter().all(|x| x.is_finite()));

        let c = gaussian_noise(&mut StdRng::seed_from_u64(3), 7, 0.5);
        assert!((c[0] - 0.5 * a[0]).abs() < 1e-6);
    }

    #[test]
    fn test_cpu_always_available() {
        let backend = OnnxBackend::new();
        assert!(backend.device_available(Device::Cpu));
        assert!(!backend.attention_available(Attention::FlashAttention2, Device::Cpu));
        assert!(backend.attention_available(Attention::Sdpa, Device::Cpu));
    }
}
