use std::io;
use thiserror::Error;

/// Result type for interconnect operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the fabric interconnect
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Signaling stream error
    #[error("event stream error: {0}")]
    Event(#[from] loopcast_event_core::Error),

    /// RTP/DTLS/SRTP layer error
    #[error("rtp error: {0}")]
    Rtp(#[from] loopcast_rtp_core::Error),

    /// Malformed event parameters
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Authentication with the peer fabric failed
    #[error("authentication failed: {0}")]
    AuthFailure(String),

    /// Peer advertised an incompatible codec
    #[error("codec mismatch: {0}")]
    CodecMismatch(String),

    /// Operation not valid in the current session state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The interconnect task is gone
    #[error("interconnect task terminated")]
    TaskGone,
}
