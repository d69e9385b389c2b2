//! Integer PCM helpers for the mixing pipeline
//!
//! The mixer works on 16-bit mono PCM widened into 32-bit accumulators:
//! per-source gain is applied while widening, sources are summed
//! saturating, and the result is clipped back to 16 bit before encoding.

use rand::Rng;

/// Audio parameters of one frame, used for VAD and loudness normalization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AudioParams {
    /// Zero crossings per second
    pub zero_crossings_rate_hz: f64,
    /// Mean power per sample relative to full scale, in dBFS
    pub powerlevel_density_dbfs: f64,
    /// Peak absolute amplitude
    pub max_amplitude: i16,
}

/// Compute zero-crossing rate, powerlevel density and peak amplitude.
pub fn audio_params(pcm: &[i16], sample_rate_hz: u32) -> AudioParams {
    if pcm.is_empty() || sample_rate_hz == 0 {
        return AudioParams {
            zero_crossings_rate_hz: 0.0,
            powerlevel_density_dbfs: f64::NEG_INFINITY,
            max_amplitude: 0,
        };
    }

    let mut crossings = 0u64;
    let mut power_sum = 0.0f64;
    let mut max_amplitude: i16 = 0;

    for window in pcm.windows(2) {
        if (window[0] >= 0) != (window[1] >= 0) {
            crossings += 1;
        }
    }
    for &sample in pcm {
        let s = sample as f64;
        power_sum += s * s;
        max_amplitude = max_amplitude.max(sample.unsigned_abs().min(i16::MAX as u16) as i16);
    }

    let duration_secs = pcm.len() as f64 / sample_rate_hz as f64;
    let zero_crossings_rate_hz = crossings as f64 / duration_secs;

    let full_scale = i16::MAX as f64 * i16::MAX as f64;
    let density = power_sum / pcm.len() as f64 / full_scale;
    let powerlevel_density_dbfs = if density > 0.0 {
        10.0 * density.log10()
    } else {
        f64::NEG_INFINITY
    };

    AudioParams {
        zero_crossings_rate_hz,
        powerlevel_density_dbfs,
        max_amplitude,
    }
}

/// Widen to 32 bit while applying a constant gain factor.
pub fn scale_i16_to_i32(pcm: &[i16], factor: f64) -> Vec<i32> {
    pcm.iter()
        .map(|&s| (s as f64 * factor).round() as i32)
        .collect()
}

/// Widen to 32 bit while ramping the gain linearly from `from` to `to`
/// across the frame (fade in/out on VAD edges).
pub fn fade_i16_to_i32(pcm: &[i16], from: f64, to: f64) -> Vec<i32> {
    let n = pcm.len();
    if n == 0 {
        return Vec::new();
    }
    let step = (to - from) / n as f64;
    pcm.iter()
        .enumerate()
        .map(|(i, &s)| (s as f64 * (from + step * i as f64)).round() as i32)
        .collect()
}

/// Saturating sample-wise sum of `src` into `acc`. Lengths must match;
/// mismatched frames are the caller's problem to skip.
pub fn add_i32(acc: &mut [i32], src: &[i32]) {
    for (a, &s) in acc.iter_mut().zip(src.iter()) {
        *a = a.saturating_add(s);
    }
}

/// Clip-and-narrow 32-bit accumulator samples to 16 bit.
pub fn clip_i32_to_i16(pcm: &[i32]) -> Vec<i16> {
    pcm.iter()
        .map(|&s| s.clamp(i16::MIN as i32, i16::MAX as i32) as i16)
        .collect()
}

/// Convert a level in dB (negative, relative to full scale) to a peak
/// amplitude. Levels count double: 10 dB in power equal 20 dB in levels.
pub fn db_to_amplitude(level_db: f64) -> i16 {
    let factor = 10f64.powf(level_db / 2.0 / 10.0);
    (i16::MAX as f64 * factor).round() as i16
}

/// Uniform white noise with the given peak amplitude.
pub fn white_noise(num_samples: usize, max_amplitude: i16) -> Vec<i16> {
    let mut rng = rand::thread_rng();
    let amp = max_amplitude.unsigned_abs() as i32;
    (0..num_samples)
        .map(|_| rng.gen_range(-amp..=amp) as i16)
        .collect()
}
