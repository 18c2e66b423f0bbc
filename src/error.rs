//! Typed error hierarchy for reelvault
//!
//! Workers never let these escape to the queue: terminal failures are
//! recorded in the store and the worker completes normally. The HTTP
//! handler maps lookup misses to status codes instead of errors.

use thiserror::Error;

/// Main error type for the acquisition engine
#[derive(Debug, Error)]
pub enum EngineError {
    /// Document store errors (read or write)
    #[error("Store error: {0}")]
    Store(String),

    /// Peer client errors (session, handle, or swarm level)
    #[error("Peer client error: {0}")]
    Client(String),

    /// The catalog item has no magnet for the requested quality
    #[error("No torrent with quality '{quality}' for item {id}")]
    MagnetNotFound { id: String, quality: String },

    /// Filesystem errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Media probe failed or produced unusable output
    #[error("Probe error: {0}")]
    Probe(String),

    /// Transcode pipeline failed to spawn or wire up
    #[error("Transcode error: {0}")]
    Transcode(String),

    /// Invalid input from configuration or callers
    #[error("Invalid input for '{field}': {message}")]
    InvalidInput {
        field: &'static str,
        message: String,
    },

    /// Record not found where one was required
    #[error("Not found: {0}")]
    NotFound(String),

    /// Engine is shutting down
    #[error("Engine is shutting down")]
    Shutdown,

    /// Internal error (bug)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// Create a store error
    pub fn store(message: impl Into<String>) -> Self {
        Self::Store(message.into())
    }

    /// Create a peer client error
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(field: &'static str, message: impl Into<String>) -> Self {
        Self::InvalidInput {
            field,
            message: message.into(),
        }
    }
}

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(format!("JSON error: {}", err))
    }
}
