//! Per-session mixer
//!
//! A mixer is bound to at most one session: it joins that session's
//! multicast loops, mixes whatever arrived during each 20 ms tick and
//! unicasts the re-encoded sum to the session's forward target.

mod core;
mod stream;
mod task;

pub use self::core::MixerCore;
pub use task::{MixerCommand, MixerHandle};

use std::net::{SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};

use crate::codec::DEFAULT_SAMPLE_RATE_HZ;
use crate::error::{Error, Result};
use crate::vad::VadConfig;
use loopcast_rtp_core::DEFAULT_FRAMES_PER_STREAM;

/// Default comfort-noise level in dB (negative, relative to full scale)
pub const DEFAULT_COMFORT_NOISE_DB: i32 = -70;

/// Marker bit cadence on the output stream
pub const MARKER_INTERVAL: u64 = 100;

/// Idle streams older than this are reclaimed
pub const STREAM_MAX_IDLE_SECS: u64 = 300;

/// Mixer configuration, the wire form of the `configure` event parameter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MixerConfig {
    /// Voice activity detection and normalization
    pub vad: VadConfig,
    /// Mixer sample rate
    pub sample_rate_hz: u32,
    /// Comfort-noise level in dB, converted to a peak amplitude
    pub comfort_noise: i32,
    /// Upper bound of frames mixed per tick; 0 = unbounded
    pub max_num_frames: usize,
    /// Per-SSRC ring capacity of the frame buffer
    pub frame_buffer: usize,
    /// Accepted for wire compatibility; superseded by `vad.enabled`
    pub normalize_input: bool,
    /// Emit comfort noise on ticks without input
    pub rtp_keepalive: bool,
    /// Scale the mixed sum by 1/sqrt(number of sources)
    pub normalize_mixed_by_root: bool,
}

impl Default for MixerConfig {
    fn default() -> Self {
        Self {
            vad: VadConfig::default(),
            sample_rate_hz: DEFAULT_SAMPLE_RATE_HZ,
            comfort_noise: DEFAULT_COMFORT_NOISE_DB,
            max_num_frames: 0,
            frame_buffer: DEFAULT_FRAMES_PER_STREAM,
            normalize_input: false,
            rtp_keepalive: true,
            normalize_mixed_by_root: false,
        }
    }
}

/// Forward target of a bound mixer: where the mixed stream goes and how
/// it is tagged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forward {
    pub host: String,
    pub port: u16,
    pub ssrc: u32,
    pub payload_type: u8,
}

impl Forward {
    pub fn is_valid(&self) -> bool {
        !self.host.is_empty() && self.port != 0 && self.ssrc != 0 && self.payload_type != 0
    }

    /// Resolve the forward destination.
    pub fn destination(&self) -> Result<SocketAddr> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(Error::Io)?
            .next()
            .ok_or_else(|| {
                Error::InvalidParameter(format!("unresolvable forward host {}", self.host))
            })
    }
}

fn default_volume() -> u8 {
    50
}

/// Parameters of a `join` request: which loop to join at what volume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopJoin {
    pub name: String,
    pub host: String,
    pub port: u16,
    #[serde(default = "default_volume")]
    pub volume: u8,
}
