//! Model file resolution from a local directory or a HuggingFace repository.
//!
//! A model is described by a `config.json` manifest:
//!
//! ```json
//! {
//!   "type": "voicecast-onnx",
//!   "backbone": "backbone.onnx",
//!   "backbone_int8": "backbone.int8.onnx",
//!   "decoder": "acoustic_decoder.onnx",
//!   "sample_rate": 24000,
//!   "latent_dim": 64
//! }
//! ```
//!
//! Only the backbone has quantized variants; the acoustic decoder is always
//! loaded at full precision.  Hub downloads are cached in the HuggingFace
//! cache directory (`~/.cache/huggingface/hub` by default).

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::sync::Api;
use serde::Deserialize;
use tracing::info;

use crate::device::Quantization;
use crate::engine::DEFAULT_SAMPLE_RATE;

/// Accepted values of the manifest's `type` field.
const MODEL_TYPES: &[&str] = &["voicecast-onnx"];

// ─────────────────────────────────────────────────────────────────────────────
// config.json schema
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct ModelManifest {
    #[serde(rename = "type")]
    pub model_type: String,

    /// Sequence-model backbone (text + voice → acoustic latents).
    pub backbone: String,

    #[serde(default)]
    pub backbone_int8: Option<String>,

    #[serde(default)]
    pub backbone_nf4: Option<String>,

    /// Acoustic decoder (latents → waveform).
    pub decoder: String,

    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,

    /// Width of one latent frame passed between the two graphs.
    #[serde(default = "default_latent_dim")]
    pub latent_dim: usize,
}

fn default_sample_rate() -> u32 {
    DEFAULT_SAMPLE_RATE
}

fn default_latent_dim() -> usize {
    64
}

impl ModelManifest {
    fn backbone_file(&self, quantization: Quantization) -> Result<&str> {
        match quantization {
            Quantization::None => Ok(&self.backbone),
            Quantization::Int8 => self
                .backbone_int8
                .as_deref()
                .context("model has no int8 backbone"),
            Quantization::Nf4 => self
                .backbone_nf4
                .as_deref()
                .context("model has no nf4 backbone"),
        }
    }
}

/// Local paths of everything one engine load needs.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub manifest: ModelManifest,
    pub backbone: PathBuf,
    pub decoder: PathBuf,
    /// Replacement backbone with adapter weights merged in.
    pub adapter: Option<PathBuf>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

enum Source {
    Local(PathBuf),
    Hub { api: Api, repo_id: String },
}

impl Source {
    fn open(model_id: &str) -> Result<Self> {
        let path = Path::new(model_id);
        if path.is_dir() {
            return Ok(Source::Local(path.to_path_buf()));
        }
        if !model_id.contains('/') {
            bail!("'{model_id}' is neither a local directory nor an 'org/name' repository id");
        }
        let api = Api::new().context("Failed to initialise HuggingFace Hub client")?;
        Ok(Source::Hub { api, repo_id: model_id.to_string() })
    }

    fn fetch(&self, filename: &str) -> Result<PathBuf> {
        match self {
            Source::Local(root) => {
                let path = root.join(filename);
                if !path.is_file() {
                    bail!("'{}' not found", path.display());
                }
                Ok(path)
            }
            Source::Hub { api, repo_id } => {
                info!(repo = %repo_id, file = filename, "fetching model file");
                api.model(repo_id.clone())
                    .get(filename)
                    .with_context(|| format!("Failed to download '{}' from '{}'", filename, repo_id))
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Read and validate the manifest of `model_id`.
pub fn fetch_manifest(model_id: &str) -> Result<ModelManifest> {
    let source = Source::open(model_id)?;
    read_manifest(&source)
}

fn read_manifest(source: &Source) -> Result<ModelManifest> {
    let config_path = source.fetch("config.json")?;
    let bytes = std::fs::read(&config_path)
        .with_context(|| format!("Cannot read config: {}", config_path.display()))?;
    let manifest: ModelManifest =
        serde_json::from_slice(&bytes).context("Failed to parse config.json")?;

    if !MODEL_TYPES.contains(&manifest.model_type.as_str()) {
        bail!(
            "Unsupported model type '{}', expected one of {:?}",
            manifest.model_type,
            MODEL_TYPES
        );
    }
    Ok(manifest)
}

/// Resolve every file needed to load `model_id` with `quantization`.
///
/// `adapter` is a local file path or a file name inside the model source.
/// Fails when the requested quantized backbone does not exist, which lets
/// the caller fall back to full precision.
pub fn resolve_model(model_id: &str, quantization: Quantization, adapter: Option<&str>) -> Result<ModelFiles> {
    let source = Source::open(model_id)?;
    let manifest = read_manifest(&source)?;

    let backbone = source.fetch(manifest.backbone_file(quantization)?)?;
    let decoder = source.fetch(&manifest.decoder)?;
    let adapter = match adapter {
        None => None,
        Some(a) if Path::new(a).is_file() => Some(PathBuf::from(a)),
        Some(a) => Some(source.fetch(a).with_context(|| format!("Cannot resolve adapter '{a}'"))?),
    };

    Ok(ModelFiles { manifest, backbone, decoder, adapter })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn model_dir(name: &str, config: &str, files: &[&str]) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("voicecast-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("config.json"), config).unwrap();
        for f in files {
            std::fs::write(dir.join(f), b"onnx").unwrap();
        }
        dir
    }

    const CONFIG: &str = r#"{
        "type": "voicecast-onnx",
        "backbone": "backbone.onnx",
        "backbone_int8": "backbone.int8.onnx",
        "decoder": "decoder.onnx"
    }"#;

    #[test]
    fn test_local_directory_resolves() {
        let dir = model_dir("local", CONFIG, &["backbone.onnx", "backbone.int8.onnx", "decoder.onnx"]);
        let id = dir.to_str().unwrap();

        let files = resolve_model(id, Quantization::None, None).unwrap();
        assert_eq!(files.backbone, dir.join("backbone.onnx"));
        assert_eq!(files.decoder, dir.join("decoder.onnx"));
        assert_eq!(files.manifest.sample_rate, 24_000);
        assert_eq!(files.manifest.latent_dim, 64);

        let files = resolve_model(id, Quantization::Int8, None).unwrap();
        assert_eq!(files.backbone, dir.join("backbone.int8.onnx"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_quantized_backbone_is_error() {
        let dir = model_dir("nf4", CONFIG, &["backbone.onnx", "decoder.onnx"]);
        let err = resolve_model(dir.to_str().unwrap(), Quantization::Nf4, None).unwrap_err();
        assert!(err.to_string().contains("nf4"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_adapter_inside_model_dir() {
        let dir = model_dir("adapter", CONFIG, &["backbone.onnx", "decoder.onnx", "narrator.onnx"]);
        let files = resolve_model(dir.to_str().unwrap(), Quantization::None, Some("narrator.onnx")).unwrap();
        assert_eq!(files.adapter, Some(dir.join("narrator.onnx")));
        assert!(resolve_model(dir.to_str().unwrap(), Quantization::None, Some("missing.onnx")).is_err());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_wrong_model_type_rejected() {
        let dir = model_dir(
            "type",
            r#"{"type": "ONNX1", "backbone": "a", "decoder": "b"}"#,
            &[],
        );
        let err = fetch_manifest(dir.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("Unsupported model type"));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_bare_name_is_rejected_without_network() {
        assert!(fetch_manifest("definitely-not-a-dir-or-repo").is_err());
    }
}
