//! Error types for the SDK

use thiserror::Error;

/// Result type for SDK operations
pub type Result<T> = std::result::Result<T, Error>;

/// SDK errors
#[derive(Error, Debug)]
pub enum Error {
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport-level HTTP error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Server rejected the request (non-2xx)
    #[error("Server error: status {0}")]
    Server(u16),

    /// Response body was neither a JSON object nor a JSON array
    #[error("Decode error: {0}")]
    Decode(String),

    /// Authentication with the backend failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Concurrency error (channel closed, lane poisoned)
    #[error("Concurrency error: {0}")]
    Concurrency(String),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        Error::Http(err.to_string())
    }
}
