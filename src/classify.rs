//! Classification of upstream transcription failures.
//!
//! The retry policy keys off a small set of categories derived from the HTTP status when
//! one is available, falling back to case-insensitive message substrings for upstreams
//! that only report a body. Substring matching is fragile, so status always wins.

use serde::{Deserialize, Serialize};

/// Category of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    NetworkTimeout,
    ServerError,
    ClientError,
    AuthError,
    AudioFormat,
    AudioEmpty,
    AudioCorrupted,
    Unknown,
}

impl ErrorCategory {
    /// Categories the inner attempt loop will retry at all. Client-side and content errors
    /// stay in this set: a corrupted chunk head often transcribes on a later attempt.
    pub fn inner_retryable(&self) -> bool {
        !matches!(self, Self::AuthError)
    }

    /// Whole-`process` rounds allowed after the inner loop exhausts, before the chunk-0
    /// bonus. This cap is authoritative: client and auth errors never get another round.
    pub fn outer_round_cap(&self) -> u32 {
        match self {
            Self::RateLimit | Self::NetworkTimeout => 5,
            Self::ServerError => 3,
            Self::Unknown => 2,
            Self::ClientError
            | Self::AuthError
            | Self::AudioFormat
            | Self::AudioEmpty
            | Self::AudioCorrupted => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::NetworkTimeout => "network_timeout",
            Self::ServerError => "server_error",
            Self::ClientError => "client_error",
            Self::AuthError => "auth_error",
            Self::AudioFormat => "audio_format",
            Self::AudioEmpty => "audio_empty",
            Self::AudioCorrupted => "audio_corrupted",
            Self::Unknown => "unknown",
        }
    }
}

/// Extra attempts granted to chunk 0 at every level of the retry policy. The head of the
/// file carries the container metadata, so it is worth more patience than any other chunk.
pub const FIRST_CHUNK_BONUS: u32 = 2;

/// Attempts the inner loop makes before giving the outer loop a say.
pub const INNER_BASE_ATTEMPTS: u32 = 5;

/// Maximum attempts for the inner loop, honoring the chunk-0 bonus.
pub fn inner_max_attempts(first_chunk: bool) -> u32 {
    INNER_BASE_ATTEMPTS + if first_chunk { FIRST_CHUNK_BONUS } else { 0 }
}

/// Whole-`process` rounds allowed for `category`, honoring the chunk-0 bonus. Categories
/// capped at zero stay at zero.
pub fn outer_round_cap(category: ErrorCategory, first_chunk: bool) -> u32 {
    let cap = category.outer_round_cap();
    if cap == 0 {
        0
    } else {
        cap + if first_chunk { FIRST_CHUNK_BONUS } else { 0 }
    }
}

/// Backoff before attempt `attempt` (1-based): `min(2000 * 1.5^(attempt-1), 10_000)` ms.
pub fn backoff_millis(attempt: u32) -> u64 {
    let delay = 2_000.0 * 1.5_f64.powi(attempt.saturating_sub(1) as i32);
    delay.min(10_000.0) as u64
}

/// Classify an upstream failure from its HTTP status and/or message.
pub fn classify(status: Option<u16>, message: &str) -> ErrorCategory {
    if let Some(status) = status {
        match status {
            429 => return ErrorCategory::RateLimit,
            401 => return ErrorCategory::AuthError,
            500 | 502 | 503 | 504 => return ErrorCategory::ServerError,
            400 => {
                // 400 bodies still distinguish content problems worth separating for the
                // chunk-0 skip rule.
                return classify_content(message).unwrap_or(ErrorCategory::ClientError);
            }
            _ => {}
        }
    }

    let lower = message.to_ascii_lowercase();
    if lower.contains("rate limit")
        || lower.contains("too many requests")
        || lower.contains("quota exceeded")
    {
        return ErrorCategory::RateLimit;
    }
    if lower.contains("timeout") || lower.contains("econnreset") {
        return ErrorCategory::NetworkTimeout;
    }
    if lower.contains("authentication") || lower.contains("unauthorized") {
        return ErrorCategory::AuthError;
    }
    if let Some(content) = classify_content(&lower) {
        return content;
    }
    if lower.contains("invalid") || lower.contains("format") {
        return ErrorCategory::ClientError;
    }
    ErrorCategory::Unknown
}

fn classify_content(message: &str) -> Option<ErrorCategory> {
    let lower = message.to_ascii_lowercase();
    if lower.contains("audio file is empty")
        || lower.contains("no audio found")
        || lower.contains("no valid audio stream")
        || lower.contains("no speech detected")
        || lower.contains("audio too short")
    {
        return Some(ErrorCategory::AudioEmpty);
    }
    if lower.contains("unsupported audio format") || lower.contains("invalid audio format") {
        return Some(ErrorCategory::AudioFormat);
    }
    if lower.contains("corrupt") {
        return Some(ErrorCategory::AudioCorrupted);
    }
    None
}

/// Phrases that mean "this chunk carries no transcribable audio". A chunk-0 failure whose
/// final error matches one of these is eligible for the skip rule instead of failing the
/// whole head of the file.
const NO_AUDIO_PATTERNS: &[&str] = &[
    "no audio found",
    "invalid audio format",
    "audio file is empty",
    "no valid audio stream",
    "no speech detected",
    "audio too short",
    "unsupported audio format",
];

pub fn matches_no_audio_pattern(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    NO_AUDIO_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Decide whether an exhausted chunk-0 failure should become `skipped`.
///
/// Requires a no-audio message, a non-transient category, and enough attempts that we
/// trust the upstream's verdict: five in general, or three when the message itself says
/// the audio is too short or empty.
pub fn should_skip_first_chunk(
    category: ErrorCategory,
    message: &str,
    total_attempts: u32,
) -> bool {
    if matches!(
        category,
        ErrorCategory::RateLimit | ErrorCategory::NetworkTimeout
    ) {
        return false;
    }
    if !matches_no_audio_pattern(message) {
        return false;
    }
    let lower = message.to_ascii_lowercase();
    let short_signal = lower.contains("too short") || lower.contains("empty");
    total_attempts >= 5 || (total_attempts >= 3 && short_signal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_beats_substrings() {
        assert_eq!(classify(Some(429), "anything"), ErrorCategory::RateLimit);
        assert_eq!(classify(Some(401), "rate limit"), ErrorCategory::AuthError);
        assert_eq!(classify(Some(503), ""), ErrorCategory::ServerError);
        assert_eq!(classify(Some(400), "bad request"), ErrorCategory::ClientError);
    }

    #[test]
    fn bad_request_bodies_keep_content_detail() {
        assert_eq!(
            classify(Some(400), "no audio found in file"),
            ErrorCategory::AudioEmpty
        );
        assert_eq!(
            classify(Some(400), "unsupported audio format"),
            ErrorCategory::AudioFormat
        );
    }

    #[test]
    fn substring_fallback_is_case_insensitive() {
        assert_eq!(classify(None, "Rate Limit exceeded"), ErrorCategory::RateLimit);
        assert_eq!(classify(None, "read TIMEOUT"), ErrorCategory::NetworkTimeout);
        assert_eq!(classify(None, "ECONNRESET"), ErrorCategory::NetworkTimeout);
        assert_eq!(classify(None, "Unauthorized"), ErrorCategory::AuthError);
        assert_eq!(classify(None, "invalid sample rate"), ErrorCategory::ClientError);
        assert_eq!(classify(None, "mystery"), ErrorCategory::Unknown);
    }

    #[test]
    fn caps_follow_the_category_table() {
        assert_eq!(outer_round_cap(ErrorCategory::RateLimit, false), 5);
        assert_eq!(outer_round_cap(ErrorCategory::RateLimit, true), 7);
        assert_eq!(outer_round_cap(ErrorCategory::ServerError, true), 5);
        assert_eq!(outer_round_cap(ErrorCategory::Unknown, false), 2);
        assert_eq!(outer_round_cap(ErrorCategory::ClientError, true), 0);
        assert_eq!(outer_round_cap(ErrorCategory::AuthError, true), 0);
    }

    #[test]
    fn backoff_grows_and_saturates() {
        assert_eq!(backoff_millis(1), 2_000);
        assert_eq!(backoff_millis(2), 3_000);
        assert_eq!(backoff_millis(3), 4_500);
        assert_eq!(backoff_millis(10), 10_000);
    }

    #[test]
    fn skip_rule_needs_pattern_category_and_attempts() {
        assert!(should_skip_first_chunk(
            ErrorCategory::AudioEmpty,
            "no audio found",
            5
        ));
        assert!(
            !should_skip_first_chunk(ErrorCategory::AudioEmpty, "no audio found", 4),
            "four attempts without a short signal is not enough"
        );
        assert!(should_skip_first_chunk(
            ErrorCategory::AudioEmpty,
            "audio too short",
            3
        ));
        assert!(!should_skip_first_chunk(
            ErrorCategory::RateLimit,
            "no audio found",
            9
        ));
        assert!(!should_skip_first_chunk(
            ErrorCategory::Unknown,
            "backend exploded",
            9
        ));
    }
}
