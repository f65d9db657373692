//! Typed errors for the mining pipeline.
//!
//! Uses `thiserror` for library errors (not `anyhow`) to provide
//! strongly-typed, composable error handling. Only `Config` and
//! `Storage` errors from bootstrap paths are expected to reach the
//! binary; everything else is absorbed at the stage level and counted
//! in that stage's stats.

use thiserror::Error;

/// Errors that can occur during pipeline operations.
#[derive(Debug, Error)]
pub enum MinerError {
    /// Community source fetch failed
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// LLM service unavailable or failed
    #[error("AI service error: {0}")]
    Ai(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// LLM call timed out after all retries
    #[error("AI call timed out after {seconds}s")]
    AiTimeout { seconds: u64 },

    /// Retryable AI failure (rate limit, 5xx)
    #[error("transient AI error: {reason}")]
    AiTransient { reason: String },

    /// LLM returned JSON that could not be recovered
    #[error("unparseable AI response: {reason}")]
    AiResponse { reason: String },

    /// Embedding generation failed
    #[error("embedding error: {0}")]
    Embedding(String),

    /// Storage operation failed
    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Referenced row is missing
    #[error("not found: {what}")]
    NotFound { what: String },

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("config error: {0}")]
    Config(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Errors that can occur while fetching from a community source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Authentication failed; fatal at startup
    #[error("authentication failed for {source_name}: {reason}")]
    Auth { source_name: String, reason: String },

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Remote returned a rate-limit response
    #[error("rate limited by {source_name}, retry after {retry_after}s")]
    RateLimited { source_name: String, retry_after: u64 },

    /// Request timed out
    #[error("timeout fetching {what}")]
    Timeout { what: String },

    /// Response body did not match the expected shape
    #[error("malformed response from {source_name}: {reason}")]
    Malformed { source_name: String, reason: String },
}

impl MinerError {
    /// Build a storage error from anything displayable.
    pub fn storage(err: impl std::fmt::Display) -> Self {
        Self::Storage(err.to_string().into())
    }

    /// Build a config error from anything displayable.
    pub fn config(err: impl std::fmt::Display) -> Self {
        Self::Config(err.to_string().into())
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::AiTimeout { .. }
                | Self::AiTransient { .. }
                | Self::Source(SourceError::RateLimited { .. })
                | Self::Source(SourceError::Timeout { .. })
        )
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, MinerError>;

/// Result type alias for source operations.
pub type SourceResult<T> = std::result::Result<T, SourceError>;
