//! Error types for chat exchanges

use kai_relay_providers::UpstreamError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A request that cannot be forwarded as-is
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Stable, client-facing classification of an exchange failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    UpstreamRejected,
    UpstreamTimeout,
    UpstreamUnavailable,
    StreamInterrupted,
    Storage,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::UpstreamRejected => "upstream_rejected",
            ErrorKind::UpstreamTimeout => "upstream_timeout",
            ErrorKind::UpstreamUnavailable => "upstream_unavailable",
            ErrorKind::StreamInterrupted => "stream_interrupted",
            ErrorKind::Storage => "storage",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure of one chat exchange
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExchangeError {
    #[error("Invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    /// The upstream stream broke after fragments were already sent
    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Session storage failed: {0}")]
    Storage(String),
}

impl ExchangeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExchangeError::Validation(_) => ErrorKind::Validation,
            ExchangeError::Upstream(UpstreamError::Rejected { .. }) => ErrorKind::UpstreamRejected,
            ExchangeError::Upstream(UpstreamError::Timeout(_)) => ErrorKind::UpstreamTimeout,
            ExchangeError::Upstream(
                UpstreamError::Unavailable(_) | UpstreamError::InvalidResponse(_),
            ) => ErrorKind::UpstreamUnavailable,
            ExchangeError::StreamInterrupted(_) => ErrorKind::StreamInterrupted,
            ExchangeError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Whether sending the same request again later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::UpstreamTimeout | ErrorKind::UpstreamUnavailable | ErrorKind::StreamInterrupted
        )
    }

    /// Whether the request itself is at fault
    pub fn is_client_fault(&self) -> bool {
        self.kind() == ErrorKind::Validation
    }

    /// Human-readable detail without the kind prefix
    pub fn detail(&self) -> String {
        match self {
            ExchangeError::Validation(e) => e.reason.clone(),
            ExchangeError::Upstream(UpstreamError::Rejected { status, detail }) => {
                format!("HTTP {}: {}", status, detail)
            }
            ExchangeError::Upstream(
                UpstreamError::Timeout(detail)
                | UpstreamError::Unavailable(detail)
                | UpstreamError::InvalidResponse(detail),
            ) => detail.clone(),
            ExchangeError::StreamInterrupted(detail) | ExchangeError::Storage(detail) => {
                detail.clone()
            }
        }
    }
}

impl From<kai_relay_core::Error> for ExchangeError {
    fn from(e: kai_relay_core::Error) -> Self {
        ExchangeError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ExchangeError>;
