//! Engine configuration resolution: device, precision, attention kernels and
//! weight quantization.
//!
//! A request names what it *wants* ([`EngineConfig`]); [`resolve`] turns that
//! into what will actually be loaded ([`ResolvedConfig`]) using the backend's
//! view of the host:
//!
//! | Step         | Unspecified / unavailable                               |
//! |--------------|---------------------------------------------------------|
//! | device       | `auto` picks CUDA, then MPS, then CPU; a missing accelerator falls back to CPU with a warning |
//! | precision    | CUDA → bf16, MPS / CPU → f32                            |
//! | attention    | CUDA → flash-attention-2 when available, else SDPA      |
//! | quantization | only on CUDA; elsewhere degraded to none with a warning |
//! | adapter      | full-precision weights, so it forces quantization to none |
//!
//! The resolved config is the reuse key of the lifecycle manager.  Runtime
//! failures of the preferred attention kernel or of quantization are handled
//! later, by walking [`load_plan`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::EngineBackend;
use crate::error::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Enumerations
// ─────────────────────────────────────────────────────────────────────────────

/// Requested device class.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    #[default]
    Auto,
    Cuda,
    Mps,
    Cpu,
}

/// Device an engine actually runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cuda,
    Mps,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Bf16,
    F16,
    F32,
}

/// Attention kernel implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attention {
    FlashAttention2,
    Sdpa,
    Eager,
}

/// Weight compression for the sequence-model backbone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quantization {
    #[default]
    None,
    /// 8-bit integer weights.
    Int8,
    /// 4-bit normal-float weights.
    Nf4,
}

impl Attention {
    /// Kernel retried when this one fails to load.
    pub fn fallback(self) -> Option<Attention> {
        match self {
            Attention::FlashAttention2 => Some(Attention::Sdpa),
            Attention::Sdpa => Some(Attention::Eager),
            Attention::Eager => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Attention::FlashAttention2 => "flash_attention_2",
            Attention::Sdpa => "sdpa",
            Attention::Eager => "eager",
        }
    }
}

impl Device {
    pub fn as_str(self) -> &'static str {
        match self {
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Cpu => "cpu",
        }
    }

    fn supports(self, precision: Precision) -> bool {
        match self {
            Device::Cuda => true,
            Device::Mps => precision != Precision::Bf16,
            Device::Cpu => precision != Precision::F16,
        }
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Attention {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Quantization::None => "none",
            Quantization::Int8 => "int8",
            Quantization::Nf4 => "nf4",
        })
    }
}

impl FromStr for DevicePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            other => Err(Error::Configuration(format!("unknown device '{other}'"))),
        }
    }
}

impl FromStr for Attention {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "flash_attention_2" | "flash-attention-2" | "fa2" => Ok(Self::FlashAttention2),
            "sdpa" => Ok(Self::Sdpa),
            "eager" => Ok(Self::Eager),
            other => Err(Error::Configuration(format!("unknown attention implementation '{other}'"))),
        }
    }
}

impl FromStr for Quantization {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(Self::None),
            "8bit" | "int8" => Ok(Self::Int8),
            "4bit" | "nf4" => Ok(Self::Nf4),
            other => Err(Error::Configuration(format!("unknown quantization mode '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configurations
// ─────────────────────────────────────────────────────────────────────────────

/// Engine configuration as requested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_id: String,
    #[serde(default)]
    pub device: DevicePreference,
    #[serde(default)]
    pub precision: Option<Precision>,
    #[serde(default)]
    pub attention: Option<Attention>,
    #[serde(default)]
    pub quantization: Quantization,
    /// Auxiliary adapter (LoRA) weights applied on top of the base model.
    #[serde(default)]
    pub adapter: Option<String>,
}

impl EngineConfig {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            device: DevicePreference::Auto,
            precision: None,
            attention: None,
            quantization: Quantization::None,
            adapter: None,
        }
    }
}

/// Fully resolved configuration; equality decides handle reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResolvedConfig {
    pub model_id: String,
    pub device: Device,
    pub precision: Precision,
    pub attention: Attention,
    pub quantization: Quantization,
    pub adapter: Option<String>,
}

/// Resolve a requested configuration against what `backend` can run.
pub fn resolve(config: &EngineConfig, backend: &dyn EngineBackend) -> Result<ResolvedConfig> {
    if config.model_id.trim().is_empty() {
        return Err(Error::Configuration("model id must not be empty".into()));
    }

    let device = resolve_device(config.device, backend);
    // Explicit knobs that do not fit a downgraded device are adjusted, not rejected.
    let downgraded = requested_device(config.device).is_some_and(|d| d != device);

    let default_precision = if device == Device::Cuda { Precision::Bf16 } else { Precision::F32 };
    let precision = match config.precision {
        Some(p) if !device.supports(p) && downgraded => {
            warn!(
                precision = ?p,
                %device,
                fallback = ?default_precision,
                "precision unsupported after device fallback"
            );
            default_precision
        }
        Some(p) if !device.supports(p) => {
            return Err(Error::Configuration(format!(
                "precision {p:?} is not supported on {device}"
            )))
        }
        Some(p) => p,
        None => default_precision,
    };

    let usable = |a: Attention| {
        backend.attention_available(a, device) && (a != Attention::FlashAttention2 || device == Device::Cuda)
    };
    let attention = match config.attention {
        Some(a) if !usable(a) => {
            let fallback = a.fallback().unwrap_or(Attention::Eager);
            warn!(attention = %a, %device, %fallback, "attention kernel unusable on device, using fallback");
            fallback
        }
        Some(a) => a,
        None if device == Device::Cuda
            && backend.attention_available(Attention::FlashAttention2, device) =>
        {
            Attention::FlashAttention2
        }
        None => Attention::Sdpa,
    };

    let quantization = match config.quantization {
        Quantization::None => Quantization::None,
        q if device != Device::Cuda => {
            warn!(quantization = %q, %device, "quantization needs cuda; loading full precision");
            Quantization::None
        }
        q if config.adapter.is_some() => {
            warn!(quantization = %q, "adapter weights replace the backbone; loading full precision");
            Quantization::None
        }
        q => q,
    };

    Ok(ResolvedConfig {
        model_id: config.model_id.clone(),
        device,
        precision,
        attention,
        quantization,
        adapter: config.adapter.clone(),
    })
}

/// Concrete device named by `preference`, if any.
fn requested_device(preference: DevicePreference) -> Option<Device> {
    match preference {
        DevicePreference::Auto => None,
        DevicePreference::Cuda => Some(Device::Cuda),
        DevicePreference::Mps => Some(Device::Mps),
        DevicePreference::Cpu => Some(Device::Cpu),
    }
}

fn resolve_device(preference: DevicePreference, backend: &dyn EngineBackend) -> Device {
    let wanted = match preference {
        DevicePreference::Auto => {
            let picked = [Device::Cuda, Device::Mps]
                .into_iter()
                .find(|d| backend.device_available(*d))
                .unwrap_or(Device::Cpu);
            info!(device = %picked, backend = backend.name(), "auto-selected device");
            return picked;
        }
        DevicePreference::Cuda => Device::Cuda,
        DevicePreference::Mps => Device::Mps,
        DevicePreference::Cpu => return Device::Cpu,
    };
    if backend.device_available(wanted) {
        wanted
    } else {
        warn!(requested = %wanted, "device unavailable, falling back to cpu");
        Device::Cpu
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Load attempts
// ─────────────────────────────────────────────────────────────────────────────

/// One concrete configuration to try loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadAttempt {
    pub attention: Attention,
    pub quantization: Quantization,
}

impl LoadAttempt {
    /// Apply this attempt's knobs to `resolved`.
    pub fn apply(&self, resolved: &ResolvedConfig) -> ResolvedConfig {
        ResolvedConfig {
            attention: self.attention,
            quantization: self.quantization,
            ..resolved.clone()
        }
    }
}

/// Outcome of one load attempt, kept for logging and error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptOutcome {
    pub attempt: LoadAttempt,
    pub error: Option<String>,
}

/// Ordered load attempts for `resolved`.
///
/// The preferred kernel is retried once with its fallback; a quantized
/// config is then retried at full precision with both kernels.
pub fn load_plan(resolved: &ResolvedConfig) -> Vec<LoadAttempt> {
    let kernels: Vec<Attention> = std::iter::once(resolved.attention)
        .chain(resolved.attention.fallback())
        .collect();
    let mut quants = vec![resolved.quantization];
    if resolved.quantization != Quantization::None {
        quants.push(Quantization::None);
    }

    let mut plan = Vec::with_capacity(kernels.len() * quants.len());
    for quantization in quants {
        for &attention in &kernels {
            let attempt = LoadAttempt { attention, quantization };
            if !plan.contains(&attempt) {
                plan.push(attempt);
            }
        }
    }
    plan
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SyntheticBackend;

    fn cfg(device: DevicePreference) -> EngineConfig {
        EngineConfig { device, ..EngineConfig::new("synthetic/voice") }
    }

    #[test]
    fn test_unavailable_accelerator_falls_back_to_cpu() {
        let backend = SyntheticBackend::new(24_000);
        let resolved = resolve(&cfg(DevicePreference::Cuda), &backend).unwrap();
        assert_eq!(resolved.device, Device::Cpu);
        assert_eq!(resolved.precision, Precision::F32);
        assert_eq!(resolved.attention, Attention::Sdpa);
    }

    #[test]
    fn test_auto_prefers_cuda_with_flash_attention() {
        let backend = SyntheticBackend::new(24_000).with_devices(&[Device::Cuda, Device::Cpu]);
        let resolved = resolve(&cfg(DevicePreference::Auto), &backend).unwrap();
        assert_eq!(resolved.device, Device::Cuda);
        assert_eq!(resolved.precision, Precision::Bf16);
        assert_eq!(resolved.attention, Attention::FlashAttention2);
    }

    #[test]
    fn test_auto_without_flash_kernels_uses_sdpa() {
        let backend = SyntheticBackend::new(24_000)
            .with_devices(&[Device::Cuda])
            .without_flash_attention();
        let resolved = resolve(&cfg(DevicePreference::Auto), &backend).unwrap();
        assert_eq!(resolved.attention, Attention::Sdpa);
    }

    #[test]
    fn test_invalid_precision_is_configuration_error() {
        let backend = SyntheticBackend::new(24_000);
        let config = EngineConfig {
            precision: Some(Precision::F16),
            ..cfg(DevicePreference::Cpu)
        };
        let err = resolve(&config, &backend).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)), "{err}");
    }

    #[test]
    fn test_flash_attention_request_survives_cpu_fallback() {
        let backend = SyntheticBackend::new(24_000);
        let config = EngineConfig {
            attention: Some(Attention::FlashAttention2),
            ..cfg(DevicePreference::Cuda)
        };
        let resolved = resolve(&config, &backend).unwrap();
        assert_eq!(resolved.device, Device::Cpu);
        assert_eq!(resolved.attention, Attention::Sdpa);
    }

    #[test]
    fn test_half_precision_request_survives_cpu_fallback() {
        let backend = SyntheticBackend::new(24_000);
        let config = EngineConfig {
            precision: Some(Precision::F16),
            ..cfg(DevicePreference::Cuda)
        };
        let resolved = resolve(&config, &backend).unwrap();
        assert_eq!(resolved.device, Device::Cpu);
        assert_eq!(resolved.precision, Precision::F32);
    }

    #[test]
    fn test_flash_attention_on_explicit_cpu_uses_sdpa() {
        let backend = SyntheticBackend::new(24_000);
        let config = EngineConfig {
            attention: Some(Attention::FlashAttention2),
            ..cfg(DevicePreference::Cpu)
        };
        assert_eq!(resolve(&config, &backend).unwrap().attention, Attention::Sdpa);
    }

    #[test]
    fn test_empty_model_id_rejected() {
        let backend = SyntheticBackend::new(24_000);
        assert!(resolve(&EngineConfig::new("  "), &backend).is_err());
    }

    #[test]
    fn test_quantization_degrades_off_cuda() {
        let backend = SyntheticBackend::new(24_000);
        let config = EngineConfig {
            quantization: Quantization::Nf4,
            ..cfg(DevicePreference::Cpu)
        };
        assert_eq!(resolve(&config, &backend).unwrap().quantization, Quantization::None);
    }

    #[test]
    fn test_adapter_disables_quantization() {
        let backend = SyntheticBackend::new(24_000).with_devices(&[Device::Cuda]);
        let config = EngineConfig {
            quantization: Quantization::Int8,
            adapter: Some("adapters/narrator.onnx".into()),
            ..cfg(DevicePreference::Cuda)
        };
        let resolved = resolve(&config, &backend).unwrap();
        assert_eq!(resolved.quantization, Quantization::None);
        assert_eq!(load_plan(&resolved).len(), 2);
    }

    #[test]
    fn test_load_plan_order() {
        let backend = SyntheticBackend::new(24_000).with_devices(&[Device::Cuda]);
        let config = EngineConfig {
            quantization: Quantization::Int8,
            ..cfg(DevicePreference::Cuda)
        };
        let resolved = resolve(&config, &backend).unwrap();
        let plan = load_plan(&resolved);
        let expect = [
            (Attention::FlashAttention2, Quantization::Int8),
            (Attention::Sdpa, Quantization::Int8),
            (Attention::FlashAttention2, Quantization::None),
            (Attention::Sdpa, Quantization::None),
        ];
        let got: Vec<_> = plan.iter().map(|a| (a.attention, a.quantization)).collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn test_load_plan_eager_single_attempt() {
        let resolved = ResolvedConfig {
            model_id: "m".into(),
            device: Device::Cpu,
            precision: Precision::F32,
            attention: Attention::Eager,
            quantization: Quantization::None,
            adapter: None,
        };
        assert_eq!(load_plan(&resolved).len(), 1);
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("GPU".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert_eq!("fa2".parse::<Attention>().unwrap(), Attention::FlashAttention2);
        assert_eq!("4bit".parse::<Quantization>().unwrap(), Quantization::Nf4);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }
}
