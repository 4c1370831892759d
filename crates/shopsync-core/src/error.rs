//! Sync error taxonomy
//!
//! Every failure the core can surface is a [`SyncError`]. Each variant maps to
//! a [`RetryReason`], which is what retry policies match against.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::compression::CompressionError;
use crate::storage::StorageError;

/// Errors surfaced by the sync core
#[derive(Error, Debug)]
pub enum SyncError {
    /// Server unreachable, DNS failure, connection reset
    #[error("Network error: {0}")]
    Network(String),

    /// A call did not finish in time
    #[error("Timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// 5xx response
    #[error("Server error {status}: {message}")]
    Server { status: u16, message: String },

    /// 429 response, optionally with the server's retry hint
    #[error("Rate limited{}", retry_after_suffix(.retry_after))]
    RateLimited { retry_after: Option<Duration> },

    /// 4xx response other than auth, conflict and rate limiting
    #[error("Request rejected ({status}): {message}")]
    Client { status: u16, message: String },

    /// 401 / 403
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server reported a conflicting version of the entity
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Queue or local store I/O failure
    #[error("Persistence error: {0}")]
    Persistence(#[from] StorageError),

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The surrounding cycle was cancelled
    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    /// Server error code the client does not recognize
    #[error("Unexpected error: {0}")]
    Unknown(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}ms)", d.as_millis()),
        None => String::new(),
    }
}

/// Classification of a failure for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryReason {
    NetworkError,
    ServerError,
    Timeout,
    RateLimit,
    AuthenticationError,
    ValidationError,
    Conflict,
    Unknown,
}

impl RetryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryReason::NetworkError => "network_error",
            RetryReason::ServerError => "server_error",
            RetryReason::Timeout => "timeout",
            RetryReason::RateLimit => "rate_limit",
            RetryReason::AuthenticationError => "authentication_error",
            RetryReason::ValidationError => "validation_error",
            RetryReason::Conflict => "conflict",
            RetryReason::Unknown => "unknown",
        }
    }

    /// Reasons retried by the default policy
    pub const TRANSIENT: [RetryReason; 4] = [
        RetryReason::NetworkError,
        RetryReason::ServerError,
        RetryReason::Timeout,
        RetryReason::RateLimit,
    ];
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl SyncError {
    /// Classify this error
    pub fn reason(&self) -> RetryReason {
        match self {
            SyncError::Network(_) => RetryReason::NetworkError,
            SyncError::Timeout(_) => RetryReason::Timeout,
            SyncError::Server { .. } => RetryReason::ServerError,
            SyncError::RateLimited { .. } => RetryReason::RateLimit,
            SyncError::Client { .. } | SyncError::Serialization(_) => RetryReason::ValidationError,
            SyncError::Auth(_) => RetryReason::AuthenticationError,
            SyncError::Conflict(_) => RetryReason::Conflict,
            SyncError::Persistence(_)
            | SyncError::Compression(_)
            | SyncError::Cancelled
            | SyncError::Config(_)
            | SyncError::Unknown(_) => RetryReason::Unknown,
        }
    }

    /// Whether the failure is transient
    ///
    /// Network, timeout, 5xx and 429 are transient. Everything else is terminal
    /// at the network layer.
    pub fn is_retryable(&self) -> bool {
        RetryReason::TRANSIENT.contains(&self.reason())
    }

    /// Server-provided delay hint for rate limiting
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            SyncError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Map an HTTP status code and body onto the taxonomy
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        let message = message.into();
        match status {
            429 => SyncError::RateLimited { retry_after },
            401 | 403 => SyncError::Auth(message),
            409 => SyncError::Conflict(message),
            500..=599 => SyncError::Server { status, message },
            _ => SyncError::Client { status, message },
        }
    }
}

/// Result type for sync operations
pub type SyncResult<T> = Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(SyncError::Network("reset".into()).is_retryable());
        assert!(SyncError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(SyncError::from_status(503, "unavailable", None).is_retryable());
        assert!(SyncError::from_status(429, "", None).is_retryable());
    }

    #[test]
    fn test_terminal_classification() {
        assert!(!SyncError::from_status(400, "bad sku", None).is_retryable());
        assert!(!SyncError::from_status(401, "expired", None).is_retryable());
        assert!(!SyncError::from_status(409, "stale", None).is_retryable());
        assert!(!SyncError::Cancelled.is_retryable());
        assert!(!SyncError::Persistence(StorageError::LockPoisoned).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(SyncError::from_status(403, "", None).reason(), RetryReason::AuthenticationError);
        assert_eq!(SyncError::from_status(409, "", None).reason(), RetryReason::Conflict);
        assert_eq!(SyncError::from_status(422, "", None).reason(), RetryReason::ValidationError);
        assert_eq!(SyncError::from_status(502, "", None).reason(), RetryReason::ServerError);
    }

    #[test]
    fn test_retry_after_hint() {
        let err = SyncError::from_status(429, "slow down", Some(Duration::from_millis(5000)));
        assert_eq!(err.retry_after(), Some(Duration::from_millis(5000)));
        assert!(err.to_string().contains("5000ms"));
        assert_eq!(SyncError::Network("x".into()).retry_after(), None);
    }
}
