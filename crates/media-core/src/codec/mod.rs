//! Audio codec support
//!
//! Opus is the fabric's single codec: every loop carries `opus/48000/2`
//! payloads, decoded and mixed as mono PCM at the mixer sample rate.

mod opus;

pub use self::opus::{OpusDecoder, OpusEncoder, MAX_FRAME_SAMPLES};

/// Mix cadence in milliseconds
pub const FRAME_LENGTH_MS: u32 = 20;

/// Default mixer sample rate
pub const DEFAULT_SAMPLE_RATE_HZ: u32 = 48000;

/// Samples of one frame at the given rate
pub fn samples_per_frame(sample_rate_hz: u32) -> usize {
    (sample_rate_hz as usize * FRAME_LENGTH_MS as usize) / 1000
}
