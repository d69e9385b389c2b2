//! Voice activity detection
//!
//! Two-feature detector on zero-crossing rate and powerlevel density:
//! voice carries enough power and, unlike broadband noise, a comparatively
//! low zero-crossing rate. Each RTP stream keeps a `voice_detected` latch
//! whose edges drive the mixer's fade in/out.

use serde::{Deserialize, Serialize};

use crate::pcm::AudioParams;

/// Default zero-crossings-rate threshold in Hz
pub const DEFAULT_ZERO_CROSSINGS_RATE_HZ: u32 = 18000;

/// Default powerlevel density threshold in dBFS
pub const DEFAULT_POWERLEVEL_DENSITY_DBFS: i32 = -50;

/// VAD configuration (wire form of the `vad` configure section)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Frames whose zero-crossing rate exceeds this are not voice
    pub zero_crossings_rate_hertz: u32,
    /// Frames whose powerlevel density is below this are not voice
    pub powerlevel_density_dbfs: i32,
    /// Enable VAD-driven loudness normalization
    pub enabled: bool,
    /// Drop frames without detected voice instead of passing them plain
    pub drop: bool,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            zero_crossings_rate_hertz: DEFAULT_ZERO_CROSSINGS_RATE_HZ,
            powerlevel_density_dbfs: DEFAULT_POWERLEVEL_DENSITY_DBFS,
            enabled: false,
            drop: false,
        }
    }
}

/// Decide whether `params` describe a voice frame under `config`.
pub fn voice_detected(params: &AudioParams, config: &VadConfig) -> bool {
    params.powerlevel_density_dbfs > config.powerlevel_density_dbfs as f64
        && params.zero_crossings_rate_hz < config.zero_crossings_rate_hertz as f64
}
