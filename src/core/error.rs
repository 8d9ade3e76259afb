//! Error types for the endpoint adapter.

use thiserror::Error;

/// Adapter-wide error type.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Invalid configuration (CLI combination, bad address, missing file).
    #[error("configuration error: {0}")]
    Config(String),

    /// Unknown framer/filter name or unusable plugin directory.
    #[error("plugin error: {0}")]
    Plugin(String),

    /// Message bus failure (connect, bind, send, receive).
    #[error("bus error: {0}")]
    Bus(String),

    /// Transport connection failure (open, bind, connect, accept).
    #[error("connection error: {0}")]
    Connection(String),

    /// Underlying I/O failure on the data path.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AdapterError>;

impl AdapterError {
    /// Whether this error should tear the process down rather than be
    /// absorbed by a session-restart loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Plugin(_))
    }
}
