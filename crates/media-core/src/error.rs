use std::io;
use thiserror::Error;

/// Result type for media operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for media operations
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Codec error
    #[error("codec error: {0}")]
    Codec(String),

    /// Invalid parameter
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not valid in the current mixer state
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A joined loop with that name does not exist
    #[error("unknown loop: {0}")]
    UnknownLoop(String),

    /// RTP layer error
    #[error("RTP error: {0}")]
    Rtp(#[from] loopcast_rtp_core::Error),

    /// The mixer task is gone
    #[error("mixer task terminated")]
    TaskGone,
}
