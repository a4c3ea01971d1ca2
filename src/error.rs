//! Error types for sessync.

use std::io;
use thiserror::Error;

/// Result type alias for sessync operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in sessync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage I/O error.
    #[error("Storage error: {0}")]
    Storage(#[from] io::Error),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Invalid state encountered.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Session not found.
    #[error("Session not found: {0}")]
    SessionNotFound(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend URL could not be parsed.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// Websocket transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),

    /// Inbound frame that does not match the wire protocol.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Opening the transport took longer than the connect timeout.
    #[error("Connection attempt timed out")]
    Timeout,

    /// The connection manager is gone.
    #[error("Connection manager is no longer running")]
    Disconnected,
}
