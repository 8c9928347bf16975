//! Prober error types.
//!
//! Only [`ProbeError`] is fatal to a request. Per-target fetch and tag
//! failures are absorbed into `FetchOutcome` and missing labels.

use azmon_client::ClientError;
use thiserror::Error;

/// A query parameter was missing or malformed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("missing required parameter: {0}")]
    Missing(&'static str),

    #[error("invalid value for parameter {param}: {reason}")]
    Invalid { param: &'static str, reason: String },

    #[error("parameter {0} accepts a single value")]
    TooMany(&'static str),
}

/// Target resolution failed; the whole request fails.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    #[error("invalid resource filter: {0}")]
    InvalidFilter(String),

    #[error("resource graph query rejected: {0}")]
    GraphQuerySyntax(String),

    #[error("remote API unavailable: {0}")]
    RemoteUnavailable(String),

    #[error("target resolution did not finish before the request deadline")]
    DeadlineExceeded,
}

impl From<ClientError> for ResolutionError {
    fn from(e: ClientError) -> Self {
        match e {
            ClientError::InvalidFilter(m) => ResolutionError::InvalidFilter(m),
            ClientError::InvalidQuery(m) => ResolutionError::GraphQuerySyntax(m),
            other => ResolutionError::RemoteUnavailable(other.to_string()),
        }
    }
}

/// Tag lookup failed for one target. Never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("tag lookup failed for {resource_id}: {source}")]
pub struct EnrichmentError {
    pub resource_id: String,
    pub source: ClientError,
}

/// A fatal probe failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

impl ProbeError {
    /// HTTP status code for this failure.
    pub fn status_code(&self) -> u16 {
        match self {
            ProbeError::Parse(_) => 400,
            ProbeError::Resolution(ResolutionError::InvalidFilter(_))
            | ProbeError::Resolution(ResolutionError::GraphQuerySyntax(_)) => 400,
            ProbeError::Resolution(ResolutionError::RemoteUnavailable(_)) => 502,
            ProbeError::Resolution(ResolutionError::DeadlineExceeded) => 504,
        }
    }
}

pub type ProbeResult<T> = Result<T, ProbeError>;
