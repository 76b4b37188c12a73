//! Gateway error types

use thiserror::Error;

/// Gateway error type
#[derive(Error, Debug)]
pub enum MultiplexerError {
    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Invalid relay URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Relay sent something that is not valid protocol
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for MultiplexerError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        MultiplexerError::WebSocket(err.to_string())
    }
}

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, MultiplexerError>;

/// Fragments of error text that belong to ordinary network churn rather than bugs.
const BENIGN_ERRORS: &[&str] = &[
    "Unexpected server response",
    "Invalid URL",
    "ETIMEDOUT",
    "EPROTO",
    "timed out",
    "Connection refused",
    "Connection reset",
    "failed to lookup address",
    "HTTP error",
];

/// Whether an error message describes a known-benign network failure.
///
/// Benign failures are logged at `debug`; anything else is worth a warning.
pub fn is_benign(message: &str) -> bool {
    BENIGN_ERRORS.iter().any(|fragment| message.contains(fragment))
}
