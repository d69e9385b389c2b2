use std::io;
use thiserror::Error;

/// Result type for RTP operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for RTP, STUN, multicast and DTLS-SRTP operations
#[derive(Debug, Error)]
pub enum Error {
    /// Buffer too small for the requested operation
    #[error("buffer too small: required {required} bytes, available {available}")]
    BufferTooSmall { required: usize, available: usize },

    /// Packet failed to parse
    #[error("invalid packet: {0}")]
    InvalidPacket(String),

    /// Invalid function parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Joining the multicast group failed
    #[error("multicast join failed: {0}")]
    JoinFailed(String),

    /// DTLS handshake or transport error
    #[error("DTLS error: {0}")]
    Dtls(String),

    /// Peer certificate fingerprint did not match the announced one
    #[error("fingerprint mismatch: expected {expected}, got {actual}")]
    FingerprintMismatch { expected: String, actual: String },

    /// SRTP protect/unprotect error
    #[error("SRTP error: {0}")]
    Srtp(String),

    /// STUN message error
    #[error("STUN error: {0}")]
    Stun(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
