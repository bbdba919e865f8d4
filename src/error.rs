//! Typed failure taxonomy for the analysis pipeline.
//!
//! Every failure that reaches a photo's record boundary is converted into an
//! `AnalysisError`, persisted as a `[CODE] message` string, and later
//! re-classified from that prefix when the orchestrator decides what is
//! worth retrying.

use thiserror::Error;

/// Error codes eligible for the orchestrator's automatic retry loop.
/// Parse/validation/image failures are deterministic for a given photo and
/// prompt, so retrying them is wasted quota.
pub const RETRYABLE_CODES: &[&str] = &["TIMEOUT", "RATE_LIMIT", "API_ERROR"];

#[derive(Debug, Error)]
pub enum AnalysisError {
    /// Photo row missing or image bytes could not be fetched.
    #[error("image unavailable: {0}")]
    Image(String),

    /// Generic external service failure.
    #[error("external API failure: {0}")]
    Api(String),

    /// Downstream service is throttling us.
    #[error("rate limited: {0}")]
    RateLimit(String),

    /// External call exceeded its deadline.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// Model returned something that is not the JSON we asked for.
    #[error("unparseable model output: {0}")]
    Parse(String),

    /// Model output parsed but is semantically unusable.
    #[error("invalid model output: {0}")]
    Validation(String),

    /// Anything else.
    #[error("{0}")]
    Unknown(String),
}

impl AnalysisError {
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::Image(_) => "IMAGE_ERROR",
            AnalysisError::Api(_) => "API_ERROR",
            AnalysisError::RateLimit(_) => "RATE_LIMIT",
            AnalysisError::Timeout(_) => "TIMEOUT",
            AnalysisError::Parse(_) => "PARSE_ERROR",
            AnalysisError::Validation(_) => "VALIDATION_ERROR",
            AnalysisError::Unknown(_) => "UNKNOWN",
        }
    }

    pub fn is_retryable(&self) -> bool {
        RETRYABLE_CODES.contains(&self.code())
    }

    /// The form persisted on a FAILED record: `[CODE] message`.
    pub fn tagged(&self) -> String {
        format!("[{}] {}", self.code(), self)
    }

    /// Extract the `[CODE]` prefix from a persisted error message.
    pub fn code_of(message: &str) -> Option<&str> {
        let rest = message.strip_prefix('[')?;
        let end = rest.find(']')?;
        Some(&rest[..end])
    }

    /// Whether a persisted error message carries a retryable code.
    pub fn message_is_retryable(message: &str) -> bool {
        Self::code_of(message)
            .map(|code| RETRYABLE_CODES.contains(&code))
            .unwrap_or(false)
    }

    pub fn message_is_rate_limit(message: &str) -> bool {
        Self::code_of(message) == Some("RATE_LIMIT")
    }
}

impl From<serde_json::Error> for AnalysisError {
    fn from(err: serde_json::Error) -> Self {
        AnalysisError::Parse(err.to_string())
    }
}

impl From<reqwest::Error> for AnalysisError {
    fn from(err: reqwest::Error) -> Self {
        classify_http_error(&err)
    }
}

/// Map a transport-level error onto the taxonomy. HTTP 429 and quota text
/// become RATE_LIMIT, explicit timeouts become TIMEOUT, the rest API_ERROR.
pub fn classify_http_error(err: &reqwest::Error) -> AnalysisError {
    if err.is_timeout() {
        return AnalysisError::Timeout(err.to_string());
    }
    if let Some(status) = err.status() {
        if status.as_u16() == 429 {
            return AnalysisError::RateLimit(err.to_string());
        }
    }
    let text = err.to_string().to_lowercase();
    if text.contains("quota") || text.contains("rate limit") || text.contains("too many requests") {
        return AnalysisError::RateLimit(err.to_string());
    }
    AnalysisError::Api(err.to_string())
}
