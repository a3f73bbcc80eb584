//! Audio codec collaborator: PCM buffer → container bytes.
//!
//! | Format | Content type               | Built with              |
//! |--------|----------------------------|-------------------------|
//! | `wav`  | `audio/wav`                | always (`hound`)        |
//! | `pcm`  | `application/octet-stream` | always (raw s16le)      |
//! | `mp3`  | `audio/mpeg`               | feature `mp3`           |
//! | `flac` | `audio/flac`               | feature `flac`          |
//! | `opus` | `audio/opus`               | not available           |
//! | `aac`  | `audio/aac`                | not available           |
//! | `m4a`  | `audio/mp4`                | not available           |
//!
//! Every encoder goes through [`to_pcm16`], so samples are clamped before the
//! bit-depth reduction.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::audio::{duration_secs, to_pcm16};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    #[default]
    Mp3,
    Opus,
    Aac,
    Flac,
    Wav,
    Pcm,
    M4a,
}

impl AudioFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "mp3",
            AudioFormat::Opus => "opus",
            AudioFormat::Aac => "aac",
            AudioFormat::Flac => "flac",
            AudioFormat::Wav => "wav",
            AudioFormat::Pcm => "pcm",
            AudioFormat::M4a => "m4a",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            AudioFormat::Mp3 => "audio/mpeg",
            AudioFormat::Opus => "audio/opus",
            AudioFormat::Aac => "audio/aac",
            AudioFormat::Flac => "audio/flac",
            AudioFormat::Wav => "audio/wav",
            AudioFormat::Pcm => "application/octet-stream",
            AudioFormat::M4a => "audio/mp4",
        }
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AudioFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "mp3" => Ok(Self::Mp3),
            "opus" => Ok(Self::Opus),
            "aac" => Ok(Self::Aac),
            "flac" => Ok(Self::Flac),
            "wav" => Ok(Self::Wav),
            "pcm" => Ok(Self::Pcm),
            "m4a" => Ok(Self::M4a),
            other => Err(Error::Configuration(format!("unknown response format '{other}'"))),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Codec trait
// ─────────────────────────────────────────────────────────────────────────────

pub trait AudioCodec: Send + Sync {
    /// Encode mono `samples` at `sample_rate` into `format`.
    fn encode(&self, samples: &[f32], sample_rate: u32, format: AudioFormat) -> anyhow::Result<Vec<u8>>;

    /// Whether `format` can be produced at all, checked before generation.
    fn supports(&self, _format: AudioFormat) -> bool {
        true
    }

    fn duration(&self, samples: &[f32], sample_rate: u32) -> f64 {
        duration_secs(samples.len(), sample_rate)
    }
}

/// Codec backed by `hound` plus the optional `mp3` / `flac` encoders.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCodec;

impl AudioCodec for DefaultCodec {
    fn supports(&self, format: AudioFormat) -> bool {
        match format {
            AudioFormat::Wav | AudioFormat::Pcm => true,
            AudioFormat::Mp3 => cfg!(feature = "mp3"),
            AudioFormat::Flac => cfg!(feature = "flac"),
            AudioFormat::Opus | AudioFormat::Aac | AudioFormat::M4a => false,
        }
    }

    fn encode(&self, samples: &[f32], sample_rate: u32, format: AudioFormat) -> anyhow::Result<Vec<u8>> {
        if sample_rate == 0 {
            bail!("cannot encode at 0 Hz");
        }
        match format {
            AudioFormat::Wav => encode_wav(samples, sample_rate),
            AudioFormat::Pcm => Ok(to_pcm16(samples)
                .into_iter()
                .flat_map(i16::to_le_bytes)
                .collect()),
            #[cfg(feature = "mp3")]
            AudioFormat::Mp3 => encode_mp3(samples, sample_rate),
            #[cfg(feature = "flac")]
            AudioFormat::Flac => encode_flac(samples, sample_rate),
            other => bail!("no {other} encoder compiled into this build"),
        }
    }
}

/// 16-bit PCM WAV in memory.
fn encode_wav(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).context("Cannot start WAV stream")?;
        for s in to_pcm16(samples) {
            writer.write_sample(s).context("WAV write error")?;
        }
        writer.finalize().context("WAV finalise error")?;
    }
    Ok(cursor.into_inner())
}

#[cfg(feature = "mp3")]
fn encode_mp3(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    use anyhow::anyhow;
    use mp3lame_encoder::{Bitrate, Builder, FlushNoGap, MonoPcm, Quality};

    let mut builder = Builder::new().ok_or_else(|| anyhow!("cannot allocate LAME encoder"))?;
    builder.set_num_channels(1).map_err(|e| anyhow!("LAME channels: {e:?}"))?;
    builder.set_sample_rate(sample_rate).map_err(|e| anyhow!("LAME sample rate: {e:?}"))?;
    builder.set_brate(Bitrate::Kbps128).map_err(|e| anyhow!("LAME bitrate: {e:?}"))?;
    builder.set_quality(Quality::Best).map_err(|e| anyhow!("LAME quality: {e:?}"))?;
    let mut encoder = builder.build().map_err(|e| anyhow!("LAME init: {e:?}"))?;

    let pcm = to_pcm16(samples);
    let mut out = Vec::with_capacity(mp3lame_encoder::max_required_buffer_size(pcm.len()));
    encoder
        .encode_to_vec(MonoPcm(&pcm), &mut out)
        .map_err(|e| anyhow!("LAME encode: {e:?}"))?;
    encoder
        .flush_to_vec::<FlushNoGap>(&mut out)
        .map_err(|e| anyhow!("LAME flush: {e:?}"))?;
    Ok(out)
}

#[cfg(feature = "flac")]
fn encode_flac(samples: &[f32], sample_rate: u32) -> anyhow::Result<Vec<u8>> {
    use anyhow::anyhow;
    use flacenc::component::BitRepr;
    use flacenc::error::Verify;

    let pcm: Vec<i32> = to_pcm16(samples).into_iter().map(i32::from).collect();
    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|(_, e)| anyhow!("FLAC config: {e:?}"))?;
    let source = flacenc::source::MemSource::from_samples(&pcm, 1, 16, sample_rate as usize);
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| anyhow!("FLAC encode: {e:?}"))?;
    let mut sink = flacenc::bitsink::ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|_| anyhow!("FLAC bitstream write failed"))?;
    Ok(sink.as_slice().to_vec())
}
