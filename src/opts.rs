use serde::{Deserialize, Serialize};

/// Smallest file the chunked pipeline accepts. Anything under this is cheaper to send as a
/// single synchronous request.
pub const MIN_FILE_BYTES: u64 = 5 * 1024 * 1024;

/// Largest file the chunked pipeline accepts.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

/// Allowed chunk size range, in MiB.
pub const MIN_CHUNK_MB: u64 = 1;
pub const MAX_CHUNK_MB: u64 = 100;

/// Default chunk size when the caller doesn't pick one.
pub const DEFAULT_CHUNK_MB: u64 = 5;

/// Default ceiling on concurrent chunk uploads advertised to clients.
pub const DEFAULT_MAX_CONCURRENT_UPLOADS: usize = 3;

/// TTL for in-flight job and sub-job records, in seconds (24 h).
pub const JOB_TTL_SECONDS: u64 = 86_400;

/// TTL applied when a parent reaches a terminal state (7 days).
pub const COMPLETED_JOB_TTL_SECONDS: u64 = 7 * 86_400;

/// TTL for uploaded chunk objects in the blob store.
pub const TEMP_OBJECT_TTL_SECONDS: u64 = 86_400;

/// Expiry advertised for per-chunk upload handles, in seconds.
pub const UPLOAD_HANDLE_EXPIRY_SECONDS: u64 = 3_600;

/// When the LLM correction step runs, relative to transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmMode {
    /// Correct each chunk's transcript as it completes.
    PerChunk,
    /// Correct the assembled transcript once every chunk is terminal.
    Post,
}

/// Options that control how one parent job is processed.
///
/// This struct represents *library-level configuration*, not HTTP request fields directly.
/// The server maps request input into this type so that other frontends (tests, batch
/// drivers) can construct options programmatically.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingOptions {
    /// Whether transcripts are passed through the LLM correction step at all.
    pub use_llm: bool,

    /// When correction runs. Ignored unless `use_llm` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub llm_mode: Option<LlmMode>,

    /// Optional speech model override forwarded to the transcription backend.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Carried on the parent record for operators; dispatch is out of scope and the URL is
    /// never called.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
}

impl ProcessingOptions {
    /// True when completed chunks should be corrected individually.
    pub fn per_chunk_correction(&self) -> bool {
        self.use_llm && self.llm_mode == Some(LlmMode::PerChunk)
    }

    /// True when the assembled transcript should be corrected once at the end.
    pub fn post_correction(&self) -> bool {
        self.use_llm && self.llm_mode == Some(LlmMode::Post)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correction_modes_are_mutually_exclusive() {
        let opts = ProcessingOptions {
            use_llm: true,
            llm_mode: Some(LlmMode::PerChunk),
            ..Default::default()
        };
        assert!(opts.per_chunk_correction());
        assert!(!opts.post_correction());

        let opts = ProcessingOptions {
            use_llm: false,
            llm_mode: Some(LlmMode::Post),
            ..Default::default()
        };
        assert!(!opts.post_correction(), "llm_mode alone must not enable correction");
    }

    #[test]
    fn llm_mode_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&LlmMode::PerChunk).unwrap(),
            "\"per_chunk\""
        );
        assert_eq!(serde_json::to_string(&LlmMode::Post).unwrap(), "\"post\"");
    }
}
