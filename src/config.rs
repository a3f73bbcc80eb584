//! Process settings: model selection, generation defaults and server knobs.
//!
//! Loaded from JSON (every field optional) and then overridden by the server's
//! command-line flags / environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chunker::DEFAULT_MAX_WORDS;
use crate::codec::AudioFormat;
use crate::device::{Attention, DevicePreference, EngineConfig, Precision, Quantization};
use crate::engine::{GenerationParams, SamplingParams, DEFAULT_SAMPLE_RATE};
use crate::error::{Error, Result};
use crate::lifecycle::AcquirePolicy;
use crate::script::DEFAULT_PAUSE_MS;
use crate::stream::{StreamOptions, DEFAULT_QUEUE_CAPACITY, DEFAULT_STREAM_TIMEOUT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    // ── Engine ──────────────────────────────────────────────────────────────
    /// Local directory or HuggingFace repository id.
    pub model_id: String,
    pub device: DevicePreference,
    pub precision: Option<Precision>,
    pub attention: Option<Attention>,
    pub quantization: Quantization,
    pub adapter: Option<String>,

    // ── Generation defaults ─────────────────────────────────────────────────
    pub inference_steps: u32,
    pub guidance_scale: f32,
    pub sampling: SamplingParams,
    pub max_words_per_chunk: usize,
    pub default_pause_ms: u32,
    pub sample_rate: u32,
    pub response_format: AudioFormat,

    // ── Streaming / concurrency ─────────────────────────────────────────────
    pub queue_capacity: usize,
    pub stream_timeout_ms: u64,
    pub acquire: AcquirePolicy,

    // ── Voices ──────────────────────────────────────────────────────────────
    /// OpenAI voice name → preset name.
    pub voice_mapping: BTreeMap<String, String>,
    /// Directory holding `<preset>.wav` reference recordings.
    pub voices_dir: Option<PathBuf>,

    // ── Server ──────────────────────────────────────────────────────────────
    pub host: String,
    pub port: u16,
    pub cors_origins: String,
    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        let voice_mapping = [
            ("alloy", "en-Alice_woman"),
            ("echo", "en-Carter_man"),
            ("fable", "en-Maya_woman"),
            ("onyx", "en-Frank_man"),
            ("nova", "en-Mary_woman_bgm"),
            ("shimmer", "en-Alice_woman"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        Self {
            model_id: "microsoft/VibeVoice-1.5B".into(),
            device: DevicePreference::Auto,
            precision: None,
            attention: None,
            quantization: Quantization::None,
            adapter: None,
            inference_steps: 10,
            guidance_scale: 1.3,
            sampling: SamplingParams::default(),
            max_words_per_chunk: DEFAULT_MAX_WORDS,
            default_pause_ms: DEFAULT_PAUSE_MS,
            sample_rate: DEFAULT_SAMPLE_RATE,
            response_format: AudioFormat::Mp3,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            stream_timeout_ms: DEFAULT_STREAM_TIMEOUT.as_millis() as u64,
            acquire: AcquirePolicy::default(),
            voice_mapping,
            voices_dir: None,
            host: "0.0.0.0".into(),
            port: 8001,
            cors_origins: "*".into(),
            log_level: "info".into(),
        }
    }
}

impl Settings {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::Configuration(format!("invalid settings JSON: {e}")))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {}: {e}", path.display())))?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_words_per_chunk == 0 {
            return Err(Error::Configuration("max_words_per_chunk must be at least 1".into()));
        }
        if self.sample_rate == 0 {
            return Err(Error::Configuration("sample_rate must be positive".into()));
        }
        if self.inference_steps == 0 {
            return Err(Error::Configuration("inference_steps must be at least 1".into()));
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            model_id: self.model_id.clone(),
            device: self.device,
            precision: self.precision,
            attention: self.attention,
            quantization: self.quantization,
            adapter: self.adapter.clone(),
        }
    }

    pub fn generation_params(&self) -> GenerationParams {
        GenerationParams {
            guidance_scale: self.guidance_scale,
            steps: self.inference_steps,
            sampling: self.sampling,
        }
    }

    pub fn stream_options(&self) -> StreamOptions {
        let timeout = Duration::from_millis(self.stream_timeout_ms);
        StreamOptions {
            capacity: self.queue_capacity.max(1),
            read_timeout: timeout,
            join_timeout: timeout,
        }
    }

    /// Preset name for an OpenAI voice; other names pass through.
    pub fn map_voice<'a>(&'a self, voice: &'a str) -> &'a str {
        self.voice_mapping.get(voice).map(String::as_str).unwrap_or(voice)
    }

    /// `cors_origins` as a list; `"*"` stays a single wildcard entry.
    pub fn cors_origins_list(&self) -> Vec<String> {
        if self.cors_origins.trim() == "*" {
            return vec!["*".into()];
        }
        self.cors_origins
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let s = Settings::default();
        assert_eq!(s.inference_steps, 10);
        assert_eq!(s.guidance_scale, 1.3);
        assert_eq!(s.max_words_per_chunk, 250);
        assert_eq!(s.default_pause_ms, 1_000);
        assert_eq!(s.port, 8001);
        assert_eq!(s.response_format, AudioFormat::Mp3);
        assert_eq!(s.stream_options().read_timeout, Duration::from_secs(10));
        assert_eq!(s.map_voice("onyx"), "en-Frank_man");
        assert_eq!(s.map_voice("en-Custom"), "en-Custom");
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let s = Settings::from_json_str(
            r#"{"model_id": "local/model", "device": "cpu", "attention": "eager",
                "quantization": "int8", "acquire": {"mode": "reject"}}"#,
        )
        .unwrap();
        assert_eq!(s.model_id, "local/model");
        assert_eq!(s.device, DevicePreference::Cpu);
        assert_eq!(s.attention, Some(Attention::Eager));
        assert_eq!(s.acquire, AcquirePolicy::Reject);
        assert_eq!(s.inference_steps, 10);

        let cfg = s.engine_config();
        assert_eq!(cfg.quantization, Quantization::Int8);
        assert_eq!(cfg.model_id, "local/model");
    }

    #[test]
    fn test_invalid_settings_rejected() {
        assert!(Settings::from_json_str(r#"{"max_words_per_chunk": 0}"#).is_err());
        assert!(Settings::from_json_str(r#"{"device": "tpu"}"#).is_err());
        assert!(Settings::from_json_str("not json").is_err());
    }

    #[test]
    fn test_cors_list() {
        let mut s = Settings::default();
        assert_eq!(s.cors_origins_list(), vec!["*"]);
        s.cors_origins = "http://a, http://b,".into();
        assert_eq!(s.cors_origins_list(), vec!["http://a", "http://b"]);
    }

    #[test]
    fn test_missing_file_is_configuration_error() {
        let err = Settings::from_json_file(Path::new("/nonexistent/voicecast.json")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
