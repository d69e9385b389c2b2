//! # Backend core for the loopcast project
//!
//! The mixer control plane: a manager (`Backend`) that pools mixer
//! workers and assigns them to sessions, the registry that tracks the
//! assignments, the wire messages of the worker protocol and the worker
//! app itself (`mixer_app`, shipped as the `mixerd` binary).

pub mod backend;
pub mod error;
pub mod messages;
pub mod mixer_app;
pub mod registry;

pub use backend::{Backend, BackendConfig, BackendEvent, DEFAULT_CAPACITY};
pub use error::{Error, Result};
pub use mixer_app::{MixerAppConfig, run as run_mixer_app};
pub use registry::{MixerDescriptor, MixerRegistry};
