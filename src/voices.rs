//! Voice preset library: `<name>.wav` reference recordings in one directory.
//!
//! Preset names look like `en-Alice_woman`; the prefix before the first `-`
//! hints at the language.  OpenAI voice names (`alloy`, `onyx`, ...) are
//! mapped to presets through [`Settings::voice_mapping`](crate::config::Settings).

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::VoiceSample;

/// One listed preset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VoiceInfo {
    pub name: String,
    pub language: &'static str,
}

#[derive(Debug, Clone, Default)]
pub struct VoiceLibrary {
    presets: BTreeMap<String, PathBuf>,
}

impl VoiceLibrary {
    /// Library with no presets; every lookup misses.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Index every `.wav` file directly inside `dir`.
    pub fn scan(dir: &Path) -> Result<Self> {
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("Cannot read voices directory: {}", dir.display()))?;

        let mut presets = BTreeMap::new();
        for entry in entries {
            let path = entry.context("Cannot read voices directory entry")?.path();
            let is_wav = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"));
            if !path.is_file() || !is_wav {
                debug!(path = %path.display(), "skipping non-wav voice file");
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                presets.insert(stem.to_string(), path.clone());
            }
        }
        info!(dir = %dir.display(), presets = presets.len(), "voice presets indexed");
        Ok(Self { presets })
    }

    pub fn len(&self) -> usize {
        self.presets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.presets.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.presets.contains_key(name)
    }

    /// Presets in name order.
    pub fn list(&self) -> Vec<VoiceInfo> {
        self.presets
            .keys()
            .map(|name| VoiceInfo { name: name.clone(), language: guess_language(name) })
            .collect()
    }

    /// First English preset, else the first preset.
    pub fn default_voice(&self) -> Option<&str> {
        self.presets
            .keys()
            .find(|n| n.starts_with("en-"))
            .or_else(|| self.presets.keys().next())
            .map(String::as_str)
    }

    /// Decode preset `name` as the reference voice of `speaker`.
    /// `Ok(None)` when no such preset exists.
    pub fn load(&self, name: &str, speaker: usize, sample_rate: u32) -> Result<Option<VoiceSample>> {
        let Some(path) = self.presets.get(name) else {
            return Ok(None);
        };
        let bytes = std::fs::read(path)
            .with_context(|| format!("Cannot read voice preset: {}", path.display()))?;
        let voice = VoiceSample::from_wav_bytes(speaker, &bytes, sample_rate)
            .with_context(|| format!("Cannot decode voice preset '{name}'"))?;
        Ok(Some(voice))
    }
}

pub fn guess_language(name: &str) -> &'static str {
    match name.split('-').next() {
        Some("en") => "English",
        Some("zh") => "Chinese",
        Some("in") => "Indian English",
        _ => "Unknown",
    }
}
