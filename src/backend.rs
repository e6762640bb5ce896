//! Backend seams for the external speech-to-text and LLM correction APIs.
//!
//! The pipeline only ever talks to these traits; HTTP implementations live in
//! [`crate::backends`], and tests inject scripted stubs.

use async_trait::async_trait;
use thiserror::Error;

use crate::job::Segment;

/// An upstream failure. Carries the HTTP status when one exists so classification can
/// prefer it over message substrings.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BackendError {
    pub status: Option<u16>,
    pub message: String,
}

impl BackendError {
    pub fn new(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// A failure with no usable status (connect errors, timeouts, parse failures).
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(None, message)
    }
}

/// Result of one transcription call.
#[derive(Debug, Clone, Default)]
pub struct Transcription {
    pub text: String,
    pub segments: Vec<Segment>,
    /// Audio duration in seconds, when the upstream reports it.
    pub duration: Option<f64>,
}

/// The external speech-to-text API.
#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Transcribe a standalone audio buffer. `extension` hints the container format;
    /// `model` overrides the backend's default model.
    async fn transcribe(
        &self,
        audio: &[u8],
        extension: &str,
        model: Option<&str>,
    ) -> Result<Transcription, BackendError>;
}

/// The external LLM used for transcript correction.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn correct(&self, text: &str) -> Result<String, BackendError>;
}
