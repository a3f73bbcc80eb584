//! Error taxonomy for the synthesis core.
//!
//! | Kind            | Raised by                         | Caller sees                    |
//! |-----------------|-----------------------------------|--------------------------------|
//! | `Configuration` | device / precision resolution     | request fails, process stays up|
//! | `EngineLoad`    | model construction (all attempts) | request fails, handle unloaded |
//! | `Generation`    | a chunk inference call            | remaining chunks aborted       |
//! | `ResourceBusy`  | single-flight engine lock         | retryable                      |
//! | `Encoding`      | codec                             | surfaced verbatim, no retry    |
//! | `Stalled`       | stream read timeout               | retryable                      |
//! | `Cancelled`     | reading a cancelled stream        | stream ends                    |
//!
//! Malformed pause markers never produce an error: they degrade to literal text
//! inside [`crate::script`].

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("engine load failed: {0}")]
    EngineLoad(String),

    /// `chunk` is the plan index of the item that failed.
    #[error("generation failed at chunk {chunk}: {message}")]
    Generation { chunk: usize, message: String },

    #[error("engine busy: {0}")]
    ResourceBusy(String),

    #[error("encoding failed: {0}")]
    Encoding(String),

    #[error("stream stalled: no audio within {0:?}")]
    Stalled(Duration),

    #[error("stream cancelled")]
    Cancelled,
}

/// Discriminant of [`Error`], as exposed to the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    EngineLoad,
    Generation,
    ResourceBusy,
    Encoding,
    Stalled,
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Configuration => "configuration_error",
            ErrorKind::EngineLoad => "engine_load_error",
            ErrorKind::Generation => "generation_error",
            ErrorKind::ResourceBusy => "resource_busy_error",
            ErrorKind::Encoding => "encoding_error",
            ErrorKind::Stalled => "stalled_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Structured `{kind, message}` form of an [`Error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration(_) => ErrorKind::Configuration,
            Error::EngineLoad(_) => ErrorKind::EngineLoad,
            Error::Generation { .. } => ErrorKind::Generation,
            Error::ResourceBusy(_) => ErrorKind::ResourceBusy,
            Error::Encoding(_) => ErrorKind::Encoding,
            Error::Stalled(_) => ErrorKind::Stalled,
            Error::Cancelled => ErrorKind::Cancelled,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::ResourceBusy(_) | Error::Stalled(_))
    }

    pub fn report(&self) -> ErrorReport {
        ErrorReport {
            kind: self.kind(),
            message: self.to_string(),
            retryable: self.is_retryable(),
        }
    }

    /// Wrap an opaque engine failure, keeping its whole context chain.
    pub(crate) fn generation(chunk: usize, err: anyhow::Error) -> Self {
        Error::Generation { chunk, message: format!("{err:#}") }
    }

    pub(crate) fn encoding(err: anyhow::Error) -> Self {
        Error::Encoding(format!("{err:#}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_is_retryable() {
        let err = Error::ResourceBusy("generation in flight".into());
        assert!(err.is_retryable());
        let report = err.report();
        assert_eq!(report.kind, ErrorKind::ResourceBusy);
        assert!(report.retryable);
        assert!(report.message.contains("generation in flight"));
    }

    #[test]
    fn test_encoding_is_not_retryable() {
        let err = Error::encoding(anyhow::anyhow!("lame refused").context("mp3"));
        assert!(!err.is_retryable());
        // Context chain is preserved verbatim.
        assert_eq!(err.to_string(), "encoding failed: mp3: lame refused");
    }

    #[test]
    fn test_report_serializes_snake_case_kind() {
        let report = Error::EngineLoad("no attempts left".into()).report();
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["kind"], "engine_load");
        assert_eq!(json["retryable"], false);
    }
}
