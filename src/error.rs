//! Error types for apitape

use std::io;
use thiserror::Error;

/// Result type for apitape operations
pub type Result<T> = std::result::Result<T, RecorderError>;

/// Errors that can occur while recording a session
#[derive(Debug, Error)]
pub enum RecorderError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Wildcard pattern that does not compile to a regex
    #[error("Invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        /// Pattern as written in the filter config
        pattern: String,
        /// Underlying regex error
        source: regex::Error,
    },

    /// URL that cannot be parsed
    #[error("Invalid URL '{url}': {source}")]
    InvalidUrl {
        /// Offending URL
        url: String,
        /// Underlying parse error
        source: url::ParseError,
    },

    /// Operation not allowed in the current session state
    #[error("Invalid session state: {0}")]
    InvalidState(String),

    /// Browser process could not be started
    #[error("Browser launch failed: {0}")]
    Launch(String),

    /// Initial navigation failed
    #[error("Navigation failed: {0}")]
    Navigation(String),

    /// DevTools protocol error response or malformed message
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Capture source could not be released
    #[error("Failed to release capture source: {0}")]
    Release(String),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for RecorderError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}
