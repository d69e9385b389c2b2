use std::io;
use thiserror::Error;

/// Result type for control-plane operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for the mixer control plane
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Signaling stream error
    #[error("event stream error: {0}")]
    Event(#[from] loopcast_event_core::Error),

    /// Mixer error on the worker side
    #[error("media error: {0}")]
    Media(#[from] loopcast_media_core::Error),

    /// Malformed event parameters
    #[error("parameter error: {0}")]
    Parameter(String),

    /// Registry slot bookkeeping violation
    #[error("registry error: {0}")]
    Registry(String),

    /// A control-plane request failed or timed out
    #[error("rpc failed with code {code}: {description}")]
    Rpc { code: u32, description: String },

    /// The backend task is gone
    #[error("backend task terminated")]
    TaskGone,
}

impl Error {
    /// Build an [`Error::Rpc`] from a callback result.
    pub fn from_rpc(code: u32, description: String) -> Self {
        Error::Rpc { code, description }
    }
}
