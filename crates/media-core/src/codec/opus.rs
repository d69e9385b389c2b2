//! Opus encoder/decoder wrappers
//!
//! Thin mono wrappers around the `opus` crate with owned scratch-free
//! APIs: decode yields one frame of PCM, encode yields one packet.

use opus::{Application, Channels};

use crate::error::{Error, Result};

/// Largest Opus frame (120 ms at 48 kHz, mono)
pub const MAX_FRAME_SAMPLES: usize = 5760;

/// Largest encoded packet we hand to the encoder
const MAX_PACKET_BYTES: usize = 4000;

/// Stateful Opus decoder for one RTP stream.
pub struct OpusDecoder {
    inner: opus::Decoder,
}

impl OpusDecoder {
    pub fn new(sample_rate_hz: u32) -> Result<Self> {
        let inner = opus::Decoder::new(sample_rate_hz, Channels::Mono)
            .map_err(|e| Error::Codec(format!("opus decoder: {}", e)))?;
        Ok(Self { inner })
    }

    /// Decode one packet to 16-bit PCM.
    pub fn decode(&mut self, payload: &[u8]) -> Result<Vec<i16>> {
        let mut pcm = vec![0i16; MAX_FRAME_SAMPLES];
        let samples = self
            .inner
            .decode(payload, &mut pcm, false)
            .map_err(|e| Error::Codec(format!("opus decode: {}", e)))?;
        pcm.truncate(samples);
        Ok(pcm)
    }
}

/// Stateful Opus encoder for the mixer output stream.
pub struct OpusEncoder {
    inner: opus::Encoder,
}

impl OpusEncoder {
    pub fn new(sample_rate_hz: u32) -> Result<Self> {
        let inner = opus::Encoder::new(sample_rate_hz, Channels::Mono, Application::Voip)
            .map_err(|e| Error::Codec(format!("opus encoder: {}", e)))?;
        Ok(Self { inner })
    }

    /// Encode one frame of 16-bit PCM.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        let mut packet = vec![0u8; MAX_PACKET_BYTES];
        let bytes = self
            .inner
            .encode(pcm, &mut packet)
            .map_err(|e| Error::Codec(format!("opus encode: {}", e)))?;
        packet.truncate(bytes);
        Ok(packet)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::samples_per_frame;

    #[test]
    fn test_encode_decode_one_frame() {
        let rate = 48000;
        let samples = samples_per_frame(rate);
        let mut encoder = OpusEncoder::new(rate).unwrap();
        let mut decoder = OpusDecoder::new(rate).unwrap();

        let pcm: Vec<i16> = (0..samples)
            .map(|i| {
                let t = i as f64 / rate as f64;
                (6000.0 * (2.0 * std::f64::consts::PI * 440.0 * t).sin()) as i16
            })
            .collect();

        let packet = encoder.encode(&pcm).unwrap();
        assert!(!packet.is_empty());
        assert!(packet.len() < pcm.len() * 2);

        let decoded = decoder.decode(&packet).unwrap();
        assert_eq!(decoded.len(), samples);
    }

    #[test]
    fn test_consecutive_frames_keep_frame_size() {
        let rate = 48000;
        let samples = samples_per_frame(rate);
        let mut encoder = OpusEncoder::new(rate).unwrap();
        let mut decoder = OpusDecoder::new(rate).unwrap();

        for _ in 0..3 {
            let packet = encoder.encode(&vec![0i16; samples]).unwrap();
            let decoded = decoder.decode(&packet).unwrap();
            assert_eq!(decoded.len(), samples);
        }
    }

    #[test]
    fn test_rejects_unsupported_rate() {
        assert!(OpusEncoder::new(44100).is_err());
        assert!(OpusDecoder::new(44100).is_err());
    }
}
