//! Transport-facing synthesis calls.
//!
//! [`Synthesizer`] ties the pieces together for one request:
//!
//! 1. sanitise the script and parse pause markers,
//! 2. split text into a [`ScriptPlan`],
//! 3. acquire the engine lease,
//! 4. generate (batch or streaming),
//! 5. encode with the codec collaborator.
//!
//! The streaming variant yields [`EncodedEvent`]s; [`EncodedEvent::to_sse`]
//! renders them as server-sent-event frames.

use std::sync::Arc;
use std::time::Instant;

use base64::Engine as _;
use serde_json::json;
use tokio_stream::Stream;
use tracing::{debug, info};

use crate::audio::AudioBuffer;
use crate::chunker::ScriptPlan;
use crate::codec::{AudioCodec, AudioFormat};
use crate::config::Settings;
use crate::device::EngineConfig;
use crate::engine::{SamplingParams, VoiceSample};
use crate::error::{Error, ErrorReport, Result};
use crate::lifecycle::{EngineStatus, ResourceManager};
use crate::orchestrator::{self, draw_seed, GenerationRequest};
use crate::script::{parse_script_with_default, sanitize_text, speaker_ids};
use crate::stream::AudioStream;

/// One synthesis request; unset fields fall back to [`Settings`].
#[derive(Debug, Clone)]
pub struct SpeechRequest {
    pub script: String,
    /// Reference voices by speaker index.  Speakers without one get a
    /// synthetic voice.
    pub voices: Vec<VoiceSample>,
    pub format: Option<AudioFormat>,
    pub guidance_scale: Option<f32>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub sampling: Option<SamplingParams>,
    pub max_words: Option<usize>,
    /// Engine override; defaults to the settings' engine config.
    pub engine: Option<EngineConfig>,
}

impl SpeechRequest {
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            voices: Vec::new(),
            format: None,
            guidance_scale: None,
            steps: None,
            seed: None,
            sampling: None,
            max_words: None,
            engine: None,
        }
    }
}

/// Complete encoded result plus metadata.
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    pub audio: Vec<u8>,
    pub format: AudioFormat,
    pub sample_rate: u32,
    pub duration_secs: f64,
    /// Seed actually used (drawn at random when the request had none).
    pub seed: u64,
}

/// One item of an encoded stream.
#[derive(Debug, Clone, PartialEq)]
pub enum EncodedEvent {
    Chunk {
        chunk_id: usize,
        audio: Vec<u8>,
        format: AudioFormat,
        sample_rate: u32,
    },
    Done,
    Error(ErrorReport),
}

impl EncodedEvent {
    /// JSON payload of this event.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            EncodedEvent::Chunk { chunk_id, audio, format, sample_rate } => json!({
                "chunk_id": chunk_id,
                "audio": base64::engine::general_purpose::STANDARD.encode(audio),
                "format": format.as_str(),
                "sample_rate": sample_rate,
            }),
            EncodedEvent::Done => json!({ "done": true }),
            EncodedEvent::Error(report) => json!({
                "error": report.message,
                "type": report.kind.as_str(),
                "retryable": report.retryable,
            }),
        }
    }

    /// `data: <json>\n\n`
    pub fn to_sse(&self) -> String {
        sse_event(&self.to_json())
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, EncodedEvent::Chunk { .. })
    }
}

pub fn sse_event(payload: &serde_json::Value) -> String {
    format!("data: {payload}\n\n")
}

// ─────────────────────────────────────────────────────────────────────────────
// Synthesizer
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Synthesizer {
    manager: ResourceManager,
    codec: Arc<dyn AudioCodec>,
    settings: Arc<Settings>,
}

impl Synthesizer {
    pub fn new(manager: ResourceManager, codec: Arc<dyn AudioCodec>, settings: Arc<Settings>) -> Self {
        Self { manager, codec, settings }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn manager(&self) -> &ResourceManager {
        &self.manager
    }

    pub fn status(&self) -> EngineStatus {
        self.manager.status()
    }

    /// Generate the whole script and return the raw buffer and the seed used.
    pub async fn synthesize_pcm(&self, request: SpeechRequest) -> Result<(AudioBuffer, u64)> {
        let (engine_config, mut generation) = self.prepare(request)?;
        let seed = generation.seed;
        let started = Instant::now();
        let lease = self.manager.acquire(&engine_config).await?;
        fit_voices(&mut generation.voices, lease.sample_rate());
        let buffer = orchestrator::run_batch(lease, generation).await?;
        info!(
            seed,
            audio_secs = buffer.duration_secs(),
            generation_secs = started.elapsed().as_secs_f64(),
            "generated speech"
        );
        Ok((buffer, seed))
    }

    /// Generate and encode the whole script.
    pub async fn synthesize(&self, request: SpeechRequest) -> Result<SynthesisOutput> {
        let format = self.check_format(request.format)?;
        let (buffer, seed) = self.synthesize_pcm(request).await?;

        let codec = Arc::clone(&self.codec);
        let duration_secs = codec.duration(&buffer.samples, buffer.sample_rate);
        let sample_rate = buffer.sample_rate;
        let audio = tokio::task::spawn_blocking(move || codec.encode(&buffer.samples, buffer.sample_rate, format))
            .await
            .map_err(|e| Error::Encoding(format!("encoder task failed: {e}")))?
            .map_err(Error::encoding)?;

        debug!(bytes = audio.len(), %format, "encoded speech");
        Ok(SynthesisOutput { audio, format, sample_rate, duration_secs, seed })
    }

    /// Start streaming generation of raw PCM chunks.
    pub async fn stream_pcm(&self, request: SpeechRequest) -> Result<AudioStream> {
        let (engine_config, mut generation) = self.prepare(request)?;
        let lease = self.manager.acquire(&engine_config).await?;
        fit_voices(&mut generation.voices, lease.sample_rate());
        info!(seed = generation.seed, items = generation.plan.len(), "streaming speech");
        Ok(orchestrator::stream(
            lease,
            generation,
            self.settings.stream_options(),
            self.manager.reload_flag(),
        ))
    }

    /// Start streaming generation; every chunk is encoded on its own.
    ///
    /// The sequence always ends with [`EncodedEvent::Done`] or
    /// [`EncodedEvent::Error`].  Dropping it cancels generation.  Takes
    /// `self` by value (clones are cheap) so the stream owns what it uses.
    pub async fn stream(self, request: SpeechRequest) -> Result<impl Stream<Item = EncodedEvent> + Send + 'static> {
        let format = self.check_format(request.format)?;
        let mut audio = self.stream_pcm(request).await?;
        let codec = Arc::clone(&self.codec);

        Ok(async_stream::stream! {
            let mut failure = None;
            while let Some(item) = audio.next_chunk().await {
                let chunk = match item {
                    Ok(chunk) => chunk,
                    Err(err) => {
                        failure = Some(err.report());
                        break;
                    }
                };
                match codec.encode(&chunk.samples, chunk.sample_rate, format) {
                    Ok(bytes) => {
                        yield EncodedEvent::Chunk {
                            chunk_id: chunk.sequence,
                            audio: bytes,
                            format,
                            sample_rate: chunk.sample_rate,
                        };
                    }
                    Err(err) => {
                        failure = Some(Error::encoding(err).report());
                        break;
                    }
                }
            }
            match failure {
                Some(report) => {
                    yield EncodedEvent::Error(report);
                }
                None => {
                    yield EncodedEvent::Done;
                }
            }
        })
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn check_format(&self, format: Option<AudioFormat>) -> Result<AudioFormat> {
        let format = format.unwrap_or(self.settings.response_format);
        if !self.codec.supports(format) {
            return Err(Error::Encoding(format!("{format} encoding is not available in this build")));
        }
        Ok(format)
    }

    fn prepare(&self, request: SpeechRequest) -> Result<(EngineConfig, GenerationRequest)> {
        let settings = &self.settings;
        let script = sanitize_text(&request.script);
        let segments = parse_script_with_default(&script, settings.default_pause_ms);
        let max_words = request.max_words.unwrap_or(settings.max_words_per_chunk);
        let plan = ScriptPlan::new(&segments, max_words);

        let mut params = settings.generation_params();
        if let Some(g) = request.guidance_scale {
            params.guidance_scale = g;
        }
        if let Some(steps) = request.steps {
            if steps == 0 {
                return Err(Error::Configuration("inference steps must be at least 1".into()));
            }
            params.steps = steps;
        }
        if let Some(sampling) = request.sampling {
            params.sampling = sampling;
        }

        let mut voices = request.voices;
        for speaker in speaker_ids(&script) {
            if !voices.iter().any(|v| v.speaker == speaker) {
                debug!(speaker, "no reference voice supplied, using a synthetic one");
                voices.push(VoiceSample::synthetic(speaker, settings.sample_rate));
            }
        }
        voices.sort_by_key(|v| v.speaker);

        let seed = request.seed.unwrap_or_else(draw_seed);
        let preview: String = script.chars().take(100).collect();
        info!(
            text = %preview,
            voices = voices.len(),
            chunks = plan.chunks().count(),
            cfg = params.guidance_scale,
            steps = params.steps,
            seed,
            "prepared speech request"
        );

        let engine_config = request.engine.unwrap_or_else(|| settings.engine_config());
        Ok((engine_config, GenerationRequest { plan, voices, params, seed }))
    }
}

/// Bring every reference voice to the rate of the loaded engine.
fn fit_voices(voices: &mut [VoiceSample], rate: u32) {
    for voice in voices.iter_mut().filter(|v| v.sample_rate != rate) {
        debug!(speaker = voice.speaker, from = voice.sample_rate, to = rate, "resampling reference voice");
        *voice = voice.resampled(rate);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
