//! Socket transports

mod multicast;

pub use multicast::{LoopPacket, MulticastEndpoint};
