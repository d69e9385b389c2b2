//! # Media core for the loopcast project
//!
//! The per-session audio pipeline of the voice fabric: Opus decode of
//! every active loop source, voice-activity gating with loudness
//! normalization, gain-weighted 32-bit mixing, comfort-noise keepalive
//! and Opus re-encode onto the session's unicast RTP stream.

pub mod codec;
pub mod error;
pub mod mixer;
pub mod pcm;
pub mod vad;

pub use codec::{
    samples_per_frame, OpusDecoder, OpusEncoder, DEFAULT_SAMPLE_RATE_HZ, FRAME_LENGTH_MS,
};
pub use error::{Error, Result};
pub use mixer::{
    Forward, LoopJoin, MixerCommand, MixerConfig, MixerCore, MixerHandle,
    DEFAULT_COMFORT_NOISE_DB, MARKER_INTERVAL, STREAM_MAX_IDLE_SECS,
};
pub use vad::VadConfig;

/// Media sample type (raw audio data)
pub type Sample = i16;
