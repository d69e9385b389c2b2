//! # Interconnect core for the loopcast project
//!
//! Bridges two voice fabrics over one DTLS-SRTP association: every loop
//! that exists on both sides is transparently extended across the
//! bridge. Frames on a local loop are mirrored to the peer's matching
//! loop with the SSRC this fabric announced, and inbound bridge frames
//! are injected into the matching local loop under its local SSRC.

pub mod error;
pub mod interconnect;
pub mod messages;
pub mod session;

pub use error::{Error, Result};
pub use interconnect::{Interconnect, InterconnectConfig, LoopDefinition};
pub use messages::{ConnectMedia, ConnectMediaResponse, LoopEntry, DEFAULT_CODEC};
pub use session::{InterconnectSession, SessionState, BRIDGE_PAYLOAD_TYPE};
