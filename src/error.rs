//! Error types for the dhub client

use thiserror::Error;

/// Result type for client operations
pub type Result<T> = std::result::Result<T, DhubError>;

/// Client error types
///
/// Every variant owns its message so a single flush failure can be cloned
/// out to all callers waiting on the keys of that batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DhubError {
    /// Backend answered with a non-success status
    #[error("Failed to communicate with backend (HTTP {status}): {message}")]
    Transport { status: u16, message: String },

    /// Connection-level failure
    #[error("Network error: {0}")]
    Network(String),

    /// Waiting for pending writes took too long
    #[error("Timed out: {0}")]
    Timeout(String),

    /// Requested key does not exist on the backend
    #[error("Not found: {0}")]
    NotFound(String),

    /// Malformed index, slice or payload, rejected before any request
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Write discarded because the updater was stopped
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Content bundle could not be packed or unpacked
    #[error("Bundle error: {0}")]
    Bundle(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Worker task or pool failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DhubError {
    /// Whether a failed request is worth sending again.
    ///
    /// Lookup misses and rejected arguments fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DhubError::NotFound(_)
                | DhubError::InvalidArgument(_)
                | DhubError::Cancelled(_)
                | DhubError::Config(_)
        )
    }
}

impl From<reqwest::Error> for DhubError {
    fn from(err: reqwest::Error) -> Self {
        DhubError::Network(err.to_string())
    }
}

impl From<serde_json::Error> for DhubError {
    fn from(err: serde_json::Error) -> Self {
        DhubError::Serialization(err.to_string())
    }
}

impl From<zip::result::ZipError> for DhubError {
    fn from(err: zip::result::ZipError) -> Self {
        DhubError::Bundle(err.to_string())
    }
}

impl From<std::io::Error> for DhubError {
    fn from(err: std::io::Error) -> Self {
        DhubError::Bundle(err.to_string())
    }
}

impl From<tokio::task::JoinError> for DhubError {
    fn from(err: tokio::task::JoinError) -> Self {
        DhubError::Internal(format!("worker task failed: {}", err))
    }
}
