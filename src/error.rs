//! Request-level failure taxonomy.

use thiserror::Error;

use crate::upstream::UpstreamError;

/// Failures a chat submission can surface to its caller.
///
/// Retryable upstream failures never appear here directly; they are absorbed
/// inside the caller's retry loop and only the final post-exhaustion error
/// arrives, wrapped in [`ChatError::Upstream`].
#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing or empty request input. Checked before admission, never
    /// retried.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Admission capacity and wait queue are both saturated. Surfaced
    /// distinctly so callers can back off.
    #[error("admission queue full")]
    QueueFull,

    /// The upstream call failed with a non-retryable class, or retries were
    /// exhausted.
    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// Unexpected failure anywhere in the pipeline.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ChatError {
    /// Stable error code for API responses and event payloads.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::QueueFull => "queue_full",
            Self::Upstream(_) => "upstream_error",
            Self::Internal(_) => "internal_error",
        }
    }
}
