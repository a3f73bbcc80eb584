//! voicecast-server: HTTP front end for long-form speech synthesis.
//!
//! | Method | Path                      | Body / result                                   |
//! |--------|---------------------------|-------------------------------------------------|
//! | POST   | `/v1/audio/speech`        | OpenAI speech request → audio (chunked if `stream`) |
//! | GET    | `/v1/audio/voices`        | OpenAI-style voice list                         |
//! | POST   | `/v1/vibevoice/generate`  | multi-speaker script → audio, or SSE if `stream` |
//! | GET    | `/v1/vibevoice/voices`    | preset names with a language hint               |
//! | GET    | `/health`                 | engine status                                   |
//!
//! Every error body is `{"error": {"message", "type", "code", "retryable"}}`.
//!
//! Build with `cargo run --features server --bin voicecast-server`.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use base64::Engine as _;
use clap::Parser;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt;
use tower::ServiceBuilder;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use voicecast::{
    format_single_speaker, AcquirePolicy, Attention, AudioCodec, AudioFormat, DefaultCodec, DevicePreference,
    EncodedEvent, EngineBackend, Error, Quantization, ResourceManager, SamplingParams, Settings, SpeechRequest,
    Synthesizer, SyntheticBackend, VoiceLibrary, VoiceSample,
};

// ─────────────────────────────────────────────────────────────────────────────
// Command line
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "voicecast-server",
    version,
    about = "Long-form multi-speaker speech synthesis server"
)]
struct Args {
    /// JSON settings file; the flags below override it.
    #[arg(long, env = "VOICECAST_CONFIG")]
    config: Option<PathBuf>,

    #[arg(long, env = "VOICECAST_HOST")]
    host: Option<String>,

    #[arg(long, env = "VOICECAST_PORT")]
    port: Option<u16>,

    /// Local model directory or HuggingFace repository id.
    #[arg(long, env = "VOICECAST_MODEL")]
    model: Option<String>,

    /// auto, cuda, mps or cpu.
    #[arg(long, env = "VOICECAST_DEVICE")]
    device: Option<DevicePreference>,

    /// flash_attention_2, sdpa or eager.
    #[arg(long, env = "VOICECAST_ATTENTION")]
    attention: Option<Attention>,

    /// none, int8 or nf4.
    #[arg(long, env = "VOICECAST_QUANTIZATION")]
    quantization: Option<Quantization>,

    #[arg(long, env = "VOICECAST_ADAPTER")]
    adapter: Option<String>,

    /// Directory of `<preset>.wav` voice recordings.
    #[arg(long, env = "VOICECAST_VOICES_DIR")]
    voices_dir: Option<PathBuf>,

    #[arg(long, env = "VOICECAST_INFERENCE_STEPS")]
    inference_steps: Option<u32>,

    /// Comma-separated origins, or `*`.
    #[arg(long, env = "VOICECAST_CORS_ORIGINS")]
    cors_origins: Option<String>,

    #[arg(long, env = "VOICECAST_LOG_LEVEL")]
    log_level: Option<String>,

    /// Answer 503 while the engine is busy instead of queueing.
    #[arg(long)]
    reject_busy: bool,

    /// Use the synthetic backend even when the ONNX backend is compiled in.
    #[arg(long)]
    synthetic: bool,

    /// Load the engine before accepting requests.
    #[arg(long)]
    preload: bool,
}

impl Args {
    fn settings(&self) -> anyhow::Result<Settings> {
        let mut s = match &self.config {
            Some(path) => Settings::from_json_file(path)?,
            None => Settings::default(),
        };
        if let Some(v) = &self.host {
            s.host = v.clone();
        }
        if let Some(v) = self.port {
            s.port = v;
        }
        if let Some(v) = &self.model {
            s.model_id = v.clone();
        }
        if let Some(v) = self.device {
            s.device = v;
        }
        if let Some(v) = self.attention {
            s.attention = Some(v);
        }
        if let Some(v) = self.quantization {
            s.quantization = v;
        }
        if let Some(v) = &self.adapter {
            s.adapter = Some(v.clone());
        }
        if let Some(v) = &self.voices_dir {
            s.voices_dir = Some(v.clone());
        }
        if let Some(v) = self.inference_steps {
            s.inference_steps = v;
        }
        if let Some(v) = &self.cors_origins {
            s.cors_origins = v.clone();
        }
        if let Some(v) = &self.log_level {
            s.log_level = v.clone();
        }
        if self.reject_busy {
            s.acquire = AcquirePolicy::Reject;
        }
        s.validate()?;
        Ok(s)
    }

    fn backend(&self, settings: &Settings) -> Arc<dyn EngineBackend> {
        #[cfg(feature = "onnx")]
        if !self.synthetic {
            return Arc::new(voicecast::onnx::OnnxBackend::new());
        }
        #[cfg(not(feature = "onnx"))]
        if !self.synthetic {
            warn!("built without the `onnx` feature, serving the synthetic backend");
        }
        Arc::new(SyntheticBackend::new(settings.sample_rate))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

struct ApiError {
    status: StatusCode,
    kind: &'static str,
    message: String,
    retryable: bool,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            kind: "invalid_request_error",
            message: message.into(),
            retryable: false,
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            kind: "server_error",
            message: format!("{err:#}"),
            retryable: false,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Configuration(_) => StatusCode::BAD_REQUEST,
            Error::ResourceBusy(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Stalled(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let report = err.report();
        Self {
            status,
            kind: report.kind.as_str(),
            message: report.message,
            retryable: report.retryable,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            warn!(status = %self.status, kind = self.kind, "{}", self.message);
        }
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": self.kind,
                "code": self.status.as_u16(),
                "retryable": self.retryable,
            }
        }));
        let mut response = (self.status, body).into_response();
        if self.status == StatusCode::SERVICE_UNAVAILABLE {
            response.headers_mut().insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    synth: Synthesizer,
    voices: Arc<VoiceLibrary>,
}

impl AppState {
    /// Preset `name` (an OpenAI name or a preset name) as `speaker`'s voice.
    /// With no presets configured every name gets a synthetic voice.
    fn resolve_voice(&self, name: &str, speaker: usize) -> Result<VoiceSample, ApiError> {
        let settings = self.synth.settings();
        let rate = settings.sample_rate;
        for candidate in [settings.map_voice(name), name] {
            if let Some(voice) = self.voices.load(candidate, speaker, rate).map_err(ApiError::internal)? {
                return Ok(voice);
            }
        }
        if self.voices.is_empty() {
            debug!(voice = name, speaker, "no voice presets configured, using a synthetic voice");
            return Ok(VoiceSample::synthetic(speaker, rate));
        }
        let openai: Vec<&str> = settings.voice_mapping.keys().map(String::as_str).collect();
        let presets: Vec<String> = self.voices.list().into_iter().map(|v| v.name).collect();
        Err(ApiError::bad_request(format!(
            "Voice '{}' not found. OpenAI voices: {}. Presets: {}",
            name,
            openai.join(", "),
            presets.join(", ")
        )))
    }
}

fn parse_format(name: Option<&str>) -> Result<Option<AudioFormat>, ApiError> {
    name.map(|n| n.parse::<AudioFormat>()).transpose().map_err(ApiError::from)
}

fn audio_headers(format: AudioFormat, filename: &str) -> [(HeaderName, String); 2] {
    [
        (header::CONTENT_TYPE, format.content_type().to_string()),
        (header::CONTENT_DISPOSITION, format!("attachment; filename={filename}.{format}")),
    ]
}

/// Raw encoded chunks, back to back, for chunked transfer.
/// Raw audio body.  A mid-stream failure aborts the chunked body so the
/// client sees a broken transfer, not a short file.
fn chunked_audio(
    events: impl tokio_stream::Stream<Item = EncodedEvent> + Send + 'static,
    format: AudioFormat,
) -> Response {
    let body = events.filter_map(|event| match event {
        EncodedEvent::Chunk { audio, .. } => Some(Ok(audio)),
        EncodedEvent::Error(report) => {
            warn!(kind = report.kind.as_str(), "stream ended early: {}", report.message);
            Some(Err(std::io::Error::other(report.message)))
        }
        EncodedEvent::Done => None,
    });
    ([(header::CONTENT_TYPE, format.content_type())], Body::from_stream(body)).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// OpenAI-compatible endpoint
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct OpenAiSpeechRequest {
    #[serde(default)]
    model: Option<String>,
    input: String,
    voice: String,
    #[serde(default)]
    response_format: Option<String>,
    #[serde(default)]
    speed: Option<f32>,
    #[serde(default)]
    stream: bool,
}

async fn openai_speech(
    State(state): State<AppState>,
    Json(req): Json<OpenAiSpeechRequest>,
) -> Result<Response, ApiError> {
    if req.input.trim().is_empty() {
        return Err(ApiError::bad_request("input must not be empty"));
    }
    if req.speed.is_some_and(|s| (s - 1.0).abs() > f32::EPSILON) {
        warn!(speed = req.speed, "speed is not supported and is ignored");
    }
    debug!(model = ?req.model, voice = %req.voice, "openai speech request");

    let format = parse_format(req.response_format.as_deref())?;
    let voice = state.resolve_voice(&req.voice, 0)?;

    let mut request = SpeechRequest::new(format_single_speaker(&req.input, 0));
    request.voices = vec![voice];
    request.format = format;

    if req.stream {
        let format = format.unwrap_or(state.synth.settings().response_format);
        let events = state.synth.clone().stream(request).await?;
        return Ok(chunked_audio(events, format));
    }

    let output = state.synth.synthesize(request).await?;
    Ok((audio_headers(output.format, "speech"), output.audio).into_response())
}

async fn openai_voices(State(state): State<AppState>) -> Json<serde_json::Value> {
    let data: Vec<_> = state
        .voices
        .list()
        .into_iter()
        .map(|v| json!({ "id": v.name, "object": "voice", "name": v.name }))
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Multi-speaker endpoint
// ─────────────────────────────────────────────────────────────────────────────

const MAX_SPEAKERS: usize = 4;

#[derive(Debug, Deserialize)]
struct SpeakerConfig {
    speaker_id: usize,
    #[serde(default)]
    voice_preset: Option<String>,
    #[serde(default)]
    voice_sample_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GenerateRequest {
    script: String,
    speakers: Vec<SpeakerConfig>,
    #[serde(default)]
    cfg_scale: Option<f32>,
    #[serde(default)]
    inference_steps: Option<u32>,
    #[serde(default)]
    response_format: Option<String>,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    seed: Option<u64>,
    #[serde(default)]
    sampling: Option<SamplingParams>,
}

impl GenerateRequest {
    fn validate(&self) -> Result<(), ApiError> {
        if self.script.trim().is_empty() {
            return Err(ApiError::bad_request("script must not be empty"));
        }
        if self.speakers.is_empty() || self.speakers.len() > MAX_SPEAKERS {
            return Err(ApiError::bad_request(format!("between 1 and {MAX_SPEAKERS} speakers are required")));
        }
        let mut ids: Vec<usize> = self.speakers.iter().map(|s| s.speaker_id).collect();
        ids.sort_unstable();
        if ids != (0..self.speakers.len()).collect::<Vec<_>>() {
            return Err(ApiError::bad_request(format!(
                "Speaker IDs must be sequential starting from 0. Got: {ids:?}"
            )));
        }
        if let Some(cfg) = self.cfg_scale {
            if !(1.0..=2.0).contains(&cfg) {
                return Err(ApiError::bad_request("cfg_scale must be between 1.0 and 2.0"));
            }
        }
        if let Some(steps) = self.inference_steps {
            if !(5..=50).contains(&steps) {
                return Err(ApiError::bad_request("inference_steps must be between 5 and 50"));
            }
        }
        Ok(())
    }
}

fn decode_voice_sample(encoded: &str, speaker: usize, sample_rate: u32) -> Result<VoiceSample, ApiError> {
    // Accept bare base64 or a `data:audio/wav;base64,` URL.
    let payload = match encoded.split_once(',') {
        Some((prefix, data)) if prefix.starts_with("data:") => data,
        _ => encoded,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::bad_request(format!("Speaker {speaker}: invalid base64 voice sample: {e}")))?;
    VoiceSample::from_wav_bytes(speaker, &bytes, sample_rate)
        .map_err(|e| ApiError::bad_request(format!("Speaker {speaker}: {e:#}")))
}

async fn vibevoice_generate(
    State(state): State<AppState>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    req.validate()?;
    let format = parse_format(req.response_format.as_deref())?;
    let sample_rate = state.synth.settings().sample_rate;

    let mut voices = Vec::with_capacity(req.speakers.len());
    for speaker in &req.speakers {
        let voice = match (&speaker.voice_sample_base64, &speaker.voice_preset) {
            (Some(encoded), _) => decode_voice_sample(encoded, speaker.speaker_id, sample_rate)?,
            (None, Some(preset)) => state.resolve_voice(preset, speaker.speaker_id)?,
            (None, None) => {
                return Err(ApiError::bad_request(format!(
                    "Speaker {} must have either voice_preset or voice_sample_base64",
                    speaker.speaker_id
                )))
            }
        };
        voices.push(voice);
    }

    let mut request = SpeechRequest::new(req.script);
    request.voices = voices;
    request.format = format;
    request.guidance_scale = req.cfg_scale;
    request.steps = req.inference_steps;
    request.seed = req.seed;
    request.sampling = req.sampling;

    if req.stream {
        let events = state.synth.clone().stream(request).await?;
        let body = events.map(|event| Ok::<_, Infallible>(event.to_sse()));
        let headers = [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
        ];
        return Ok((headers, Body::from_stream(body)).into_response());
    }

    let output = state.synth.synthesize(request).await?;
    let meta = [
        (HeaderName::from_static("x-audio-duration"), output.duration_secs.to_string()),
        (HeaderName::from_static("x-audio-format"), output.format.to_string()),
        (HeaderName::from_static("x-audio-sample-rate"), output.sample_rate.to_string()),
        (HeaderName::from_static("x-audio-seed"), output.seed.to_string()),
    ];
    Ok((audio_headers(output.format, "vibevoice_output"), meta, output.audio).into_response())
}

async fn vibevoice_voices(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({ "voices": state.voices.list() }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Health
// ─────────────────────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let status = state.synth.status();
    Json(json!({
        "status": "healthy",
        "model_loaded": status.loaded,
        "device": status.device.map_or_else(|| "unknown".to_string(), |d| d.to_string()),
        "model_path": state.synth.settings().model_id,
        "backend": status.backend,
        "busy": status.busy,
        "reload_pending": status.reload_pending,
        "effective": status.effective,
    }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

fn cors_layer(settings: &Settings) -> CorsLayer {
    let origins = settings.cors_origins_list();
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.iter().any(|o| o == "*") {
        return base.allow_origin(Any);
    }
    let values: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match o.parse::<HeaderValue>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(origin = %o, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(values))
}

fn router(state: AppState) -> Router {
    let cors = cors_layer(state.synth.settings());
    Router::new()
        .route("/v1/audio/speech", post(openai_speech))
        .route("/v1/audio/voices", get(openai_voices))
        .route("/v1/vibevoice/generate", post(vibevoice_generate))
        .route("/v1/vibevoice/voices", get(vibevoice_voices))
        .route("/health", get(health))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(cors))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings = args.settings()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&settings.log_level)))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let codec: Arc<dyn AudioCodec> = Arc::new(DefaultCodec);
    if !codec.supports(settings.response_format) {
        warn!(format = %settings.response_format, "default format not compiled in, falling back to wav");
        settings.response_format = AudioFormat::Wav;
    }

    let voices = match &settings.voices_dir {
        Some(dir) => VoiceLibrary::scan(dir).unwrap_or_else(|e| {
            warn!("{e:#}; continuing without voice presets");
            VoiceLibrary::empty()
        }),
        None => VoiceLibrary::empty(),
    };

    let backend = args.backend(&settings);
    let manager = ResourceManager::new(backend, settings.acquire);
    let settings = Arc::new(settings);
    let synth = Synthesizer::new(manager.clone(), codec, Arc::clone(&settings));

    if args.preload {
        let lease = manager.acquire(&settings.engine_config()).await?;
        info!(effective = ?lease.config(), "engine preloaded");
    }

    let state = AppState { synth, voices: Arc::new(voices) };
    let addr = format!("{}:{}", settings.host, settings.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(model = %settings.model_id, "listening on http://{addr}");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.release().await;
    info!("engine released, bye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("cannot listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(id: usize) -> EncodedEvent {
        EncodedEvent::Chunk {
            chunk_id: id,
            audio: vec![1, 2, 3],
            format: AudioFormat::Pcm,
            sample_rate: 24_000,
        }
    }

    #[tokio::test]
    async fn test_chunked_audio_completes_on_done() {
        let events = tokio_stream::iter(vec![chunk(0), chunk(1), EncodedEvent::Done]);
        let body = chunked_audio(events, AudioFormat::Pcm).into_body();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(bytes.len(), 6);
    }

    #[tokio::test]
    async fn test_chunked_audio_aborts_on_error() {
        let failure = Error::Generation { chunk: 1, message: "engine fault".into() }.report();
        let events = tokio_stream::iter(vec![chunk(0), EncodedEvent::Error(failure)]);
        let body = chunked_audio(events, AudioFormat::Pcm).into_body();
        let err = axum::body::to_bytes(body, usize::MAX).await.unwrap_err();
        assert!(err.to_string().contains("engine fault"), "{err}");
    }

    #[test]
    fn test_busy_maps_to_503() {
        let api: ApiError = Error::ResourceBusy("generation in flight".into()).into();
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(api.retryable);
    }
}
