//! # voicecast
//!
//! Long-form, multi-speaker speech synthesis orchestration.  A script with
//! `Speaker N:` labels and `[pause]` / `[pause:ms]` markers is split into
//! bounded chunks, generated one chunk at a time by a single shared engine,
//! and either assembled into one buffer or streamed chunk by chunk.
//!
//! ## Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//! use voicecast::{
//!     AcquirePolicy, AudioFormat, DefaultCodec, ResourceManager, Settings, SpeechRequest,
//!     Synthesizer, SyntheticBackend,
//! };
//!
//! # async fn run() -> voicecast::Result<()> {
//! let settings = Arc::new(Settings { response_format: AudioFormat::Wav, ..Settings::default() });
//! let backend = Arc::new(SyntheticBackend::new(settings.sample_rate));
//! let manager = ResourceManager::new(backend, AcquirePolicy::default());
//! let synth = Synthesizer::new(manager, Arc::new(DefaultCodec), settings);
//!
//! let out = synth
//!     .synthesize(SpeechRequest::new("Speaker 0: Hello there. [pause:500]\nSpeaker 1: Hi!"))
//!     .await?;
//! std::fs::write("dialogue.wav", &out.audio).unwrap();
//! # Ok(())
//! # }
//! ```
//!
//! ## Pipeline
//! 1. **Sanitising**: control characters stripped ([`script::sanitize_text`]).
//! 2. **Pause parsing**: text and silence segments ([`script::parse_script`]).
//! 3. **Chunking**: sentence-aware, word-bounded chunks ([`chunker::ScriptPlan`]).
//! 4. **Engine lease**: device / precision / attention / quantization resolved,
//!    loaded with fallback, held under a single-flight lock ([`lifecycle`]).
//! 5. **Generation**: per-chunk seeded RNG, batch or streaming ([`orchestrator`]).
//! 6. **Assembly & encoding**: silence inserted, clamped, encoded ([`audio`], [`codec`]).
//!
//! ## Features
//! | Feature  | Adds                                                    |
//! |----------|---------------------------------------------------------|
//! | `onnx`   | [`onnx::OnnxBackend`], ONNX Runtime inference via `ort` |
//! | `mp3`    | MP3 output through LAME                                 |
//! | `flac`   | FLAC output through `flacenc`                           |
//! | `server` | the `voicecast-server` HTTP binary                      |

pub mod audio;
pub mod chunker;
pub mod codec;
pub mod config;
pub mod device;
pub mod download;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod orchestrator;
pub mod script;
pub mod service;
pub mod stream;
pub mod voices;

#[cfg(feature = "onnx")]
pub mod onnx;

// ─── Re-exports for convenience ─────────────────────────────────────────────

pub use audio::AudioBuffer;
pub use chunker::{Chunk, PlanItem, ScriptPlan};
pub use codec::{AudioCodec, AudioFormat, DefaultCodec};
pub use config::Settings;
pub use device::{Attention, Device, DevicePreference, EngineConfig, Precision, Quantization, ResolvedConfig};
pub use engine::{
    EngineBackend, GenerationParams, SamplingParams, SpeechEngine, SyntheticBackend, VoiceSample, DEFAULT_SAMPLE_RATE,
};
pub use error::{Error, ErrorKind, ErrorReport, Result};
pub use lifecycle::{AcquirePolicy, EngineLease, EngineStatus, ResourceManager};
pub use script::{format_single_speaker, parse_script, Segment};
pub use service::{EncodedEvent, SpeechRequest, SynthesisOutput, Synthesizer};
pub use stream::{AudioChunk, AudioStream, StreamOptions};
pub use voices::VoiceLibrary;
