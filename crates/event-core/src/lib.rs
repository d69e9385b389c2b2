//! # Event core for the loopcast project
//!
//! `event-core` carries the signaling plumbing shared by the mixer control
//! plane and the fabric interconnect: the JSON event envelope, the uuid
//! callback registry that correlates asynchronous request/response pairs,
//! and the delimiter-free JSON event stream used on signaling sockets.

pub mod api;
pub mod callback;
pub mod error;
pub mod stream;

pub use api::{ErrorCode, ErrorInfo, EventMessage};
pub use callback::{Callback, CallbackRegistry, CallbackResult, DEFAULT_REQUEST_TIMEOUT};
pub use error::{Error, Result};
pub use stream::{split_io, split_tcp, EventReader, EventWriter};
