//! Client error types

use thiserror::Error;

/// Result type for remote dataset client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur while talking to a data server
#[derive(Debug, Error)]
pub enum Error {
    /// An endpoint could not be reached or the request did not complete
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server answered, but not in the expected line/message format
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// A frame could not be decoded
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Invalid connection parameters or stream request
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Event channel (WebSocket) failure
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Operation requires `connect()` to have succeeded first
    #[error("Dataset is not connected")]
    NotConnected,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failure to turn one frame's bytes into a decoded frame
///
/// Recovered locally by the streaming pipeline: the frame is counted as
/// dropped and the stream continues.
#[derive(Debug, Error)]
#[error("Frame decode failed: {message}")]
pub struct DecodeError {
    /// What went wrong
    pub message: String,
}

impl DecodeError {
    /// Create a decode error with a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Error {
    /// Build a protocol error from anything displayable
    pub(crate) fn protocol(message: impl std::fmt::Display) -> Self {
        Error::Protocol(message.to_string())
    }

    /// Whether this error came from the transport layer
    pub fn is_connection(&self) -> bool {
        matches!(self, Error::Connection(_) | Error::WebSocket(_))
    }
}
