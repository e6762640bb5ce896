//! Speech backend over an OpenAI-compatible transcription endpoint.
//!
//! Sends the chunk as a multipart upload with `response_format=verbose_json` so the
//! response carries segments and duration alongside the text. Error bodies are surfaced
//! with their HTTP status; many upstreams put the useful detail ("no audio found", rate
//! limit hints) in the body rather than the status line.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use tracing::debug;

use crate::backend::{BackendError, SpeechBackend, Transcription};
use crate::job::Segment;

const DEFAULT_MODEL: &str = "whisper-large-v3";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// HTTP [`SpeechBackend`].
pub struct HttpSpeechBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    default_model: String,
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<VerboseSegment>,
    #[serde(default)]
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct VerboseSegment {
    start: f64,
    end: f64,
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    message: String,
}

impl HttpSpeechBackend {
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Result<Self, BackendError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|err| BackendError::msg(format!("failed to build http client: {err}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
            default_model: DEFAULT_MODEL.to_owned(),
        })
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = model.into();
        self
    }

    fn mime_for(extension: &str) -> &'static str {
        match extension {
            "wav" => "audio/wav",
            "mp3" => "audio/mpeg",
            "mp4" | "m4a" => "audio/mp4",
            "flac" => "audio/flac",
            "ogg" => "audio/ogg",
            _ => "application/octet-stream",
        }
    }
}

#[async_trait]
impl SpeechBackend for HttpSpeechBackend {
    async fn transcribe(
        &self,
        audio: &[u8],
        extension: &str,
        model: Option<&str>,
    ) -> Result<Transcription, BackendError> {
        let model = model.unwrap_or(&self.default_model);
        let file_part = Part::bytes(audio.to_vec())
            .file_name(format!("chunk.{extension}"))
            .mime_str(Self::mime_for(extension))
            .map_err(|err| BackendError::msg(format!("invalid mime type: {err}")))?;

        let form = Form::new()
            .part("file", file_part)
            .text("model", model.to_owned())
            .text("response_format", "verbose_json");

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    BackendError::msg(format!("request timeout: {err}"))
                } else {
                    BackendError::msg(format!("request failed: {err}"))
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| BackendError::new(Some(status.as_u16()), err.to_string()))?;

        if !status.is_success() {
            // Prefer the structured error message; fall back to the raw body.
            let message = serde_json::from_str::<ErrorBody>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(BackendError::new(Some(status.as_u16()), message));
        }

        let parsed: VerboseTranscription = serde_json::from_str(&body)
            .map_err(|err| BackendError::msg(format!("unparseable transcription body: {err}")))?;
        debug!(
            text_len = parsed.text.len(),
            segments = parsed.segments.len(),
            "transcription response"
        );

        Ok(Transcription {
            text: parsed.text.trim().to_owned(),
            segments: parsed
                .segments
                .into_iter()
                .map(|s| Segment {
                    start: s.start,
                    end: s.end,
                    text: s.text.trim().to_owned(),
                })
                .collect(),
            duration: parsed.duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_body_parses_with_optional_fields() {
        let body = r#"{"text":" hello world ","segments":[{"start":0.0,"end":1.5,"text":" hello "}],"duration":1.5}"#;
        let parsed: VerboseTranscription = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.text, " hello world ");
        assert_eq!(parsed.segments.len(), 1);
        assert_eq!(parsed.duration, Some(1.5));

        let bare: VerboseTranscription = serde_json::from_str(r#"{"text":"hi"}"#).unwrap();
        assert!(bare.segments.is_empty());
        assert_eq!(bare.duration, None);
    }

    #[test]
    fn error_body_extracts_the_message() {
        let body = r#"{"error":{"message":"no audio found","type":"invalid_request_error"}}"#;
        let parsed: ErrorBody = serde_json::from_str(body).unwrap();
        assert_eq!(parsed.error.message, "no audio found");
    }

    #[test]
    fn mime_covers_known_extensions() {
        assert_eq!(HttpSpeechBackend::mime_for("wav"), "audio/wav");
        assert_eq!(HttpSpeechBackend::mime_for("mp3"), "audio/mpeg");
        assert_eq!(HttpSpeechBackend::mime_for("bin"), "application/octet-stream");
    }
}
