//! Sync Error Types
//!
//! Error handling for device commands, polling and persistence.

use serde::{Deserialize, Serialize};

/// Result type alias for sync engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Sync Engine Error Types
///
/// Every failure the engine can report is represented here. Errors are
/// serializable so a webview host can forward them across its IPC bridge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type", content = "message")]
pub enum Error {
    /// Durable storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Durable storage is out of space
    #[error("Storage quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Transport failed before a response arrived
    #[error("Network error: {0}")]
    Network(String),

    /// Request did not complete in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Hub or proxy answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Http {
        /// Status code returned by the proxy
        status: u16,
        /// Short diagnostic body
        body: String,
    },

    /// Body was not JSON or did not have a recognised shape
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Operation was superseded or stopped
    #[error("Cancelled: {0}")]
    Cancelled(String),
}

impl Error {
    /// Create a network error with context
    pub fn network(msg: impl Into<String>) -> Self {
        Error::Network(msg.into())
    }

    /// Create a malformed-response error with context
    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedResponse(msg.into())
    }

    /// Check if this error is worth retrying at the transport level
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Get the error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Error::Storage(_) => "SYNC_STORAGE",
            Error::QuotaExceeded(_) => "SYNC_QUOTA_EXCEEDED",
            Error::Network(_) => "SYNC_NETWORK",
            Error::Timeout(_) => "SYNC_TIMEOUT",
            Error::Http { .. } => "SYNC_HTTP",
            Error::MalformedResponse(_) => "SYNC_MALFORMED_RESPONSE",
            Error::Serialization(_) => "SYNC_SERIALIZATION",
            Error::Config(_) => "SYNC_CONFIG",
            Error::InvalidInput(_) => "SYNC_INVALID_INPUT",
            Error::Cancelled(_) => "SYNC_CANCELLED",
        }
    }
}

// Convert from various error types

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        match e.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => Error::QuotaExceeded(e.to_string()),
            _ => Error::Storage(e.to_string()),
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() {
            Error::Network(format!("Connection failed: {}", e))
        } else if e.is_decode() {
            Error::MalformedResponse(e.to_string())
        } else {
            Error::Network(e.to_string())
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(e: url::ParseError) -> Self {
        Error::Config(format!("Invalid URL: {}", e))
    }
}
