use std::io;
use thiserror::Error;

/// Result type for event operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for event streams and callback correlation
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error on a signaling socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed JSON on the wire
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Peer violated the event protocol
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Peer closed the stream
    #[error("connection closed")]
    ConnectionClosed,

    /// Internal channel to the owning task is gone
    #[error("channel closed: {0}")]
    ChannelClosed(String),
}
