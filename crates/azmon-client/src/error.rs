//! Remote client error types.

use std::time::Duration;

use thiserror::Error;

/// Result type alias for remote client operations.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by a [`crate::MetricsClient`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClientError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid metric request: {0}")]
    InvalidMetric(String),

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("invalid resource graph query: {0}")]
    InvalidQuery(String),

    #[error("throttled by remote API: {message}")]
    Throttled {
        message: String,
        /// Server-provided `Retry-After` hint.
        retry_after: Option<Duration>,
    },

    #[error("transient remote failure: {0}")]
    Transient(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("unexpected response ({status}): {message}")]
    Unexpected { status: u16, message: String },

    #[error("failed to decode response: {0}")]
    Decode(String),
}

impl ClientError {
    pub fn throttled(message: impl Into<String>) -> Self {
        ClientError::Throttled {
            message: message.into(),
            retry_after: None,
        }
    }

    /// Server-provided delay before the next attempt, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ClientError::Throttled { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Transient(e.to_string())
        }
    }
}
