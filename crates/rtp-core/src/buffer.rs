//! Per-SSRC frame buffering
//!
//! Incoming loop frames queue per synchronization source in a bounded ring.
//! Each mix tick drains exactly one frame per known source; bursts and
//! moderate reordering are absorbed by the ring, and a full ring evicts its
//! oldest frame.

use std::collections::{HashMap, VecDeque};

use crate::packet::RtpPacket;
use crate::RtpSsrc;

/// Default per-source ring capacity
pub const DEFAULT_FRAMES_PER_STREAM: usize = 10;

/// A buffered frame together with the gain it is to be mixed at.
///
/// The per-loop volume is captured at arrival time so the frame carries its
/// effective per-source gain through the buffer.
#[derive(Debug, Clone)]
pub struct BufferedFrame {
    pub packet: RtpPacket,
    /// Gain in percent, 0..=100
    pub gain: u8,
}

/// Bounded per-SSRC frame rings.
pub struct FrameBuffer {
    frames_per_stream: usize,
    streams: HashMap<RtpSsrc, VecDeque<BufferedFrame>>,
}

impl FrameBuffer {
    pub fn new(frames_per_stream: usize) -> Self {
        Self {
            frames_per_stream: frames_per_stream.max(1),
            streams: HashMap::new(),
        }
    }

    /// Queue a frame in arrival order. When the source ring is full the
    /// oldest frame is evicted and returned for disposal.
    pub fn insert(&mut self, frame: BufferedFrame) -> Option<BufferedFrame> {
        let ring = self
            .streams
            .entry(frame.packet.header.ssrc)
            .or_insert_with(VecDeque::new);
        ring.push_back(frame);
        if ring.len() > self.frames_per_stream {
            ring.pop_front()
        } else {
            None
        }
    }

    /// Yield the next frame of every known source: one frame per SSRC,
    /// oldest first. Sources drained empty are forgotten.
    pub fn take_tick(&mut self) -> Vec<BufferedFrame> {
        let mut out = Vec::with_capacity(self.streams.len());
        self.streams.retain(|_, ring| {
            if let Some(frame) = ring.pop_front() {
                out.push(frame);
            }
            !ring.is_empty()
        });
        out
    }

    /// Number of frames queued for `ssrc`.
    pub fn queued(&self, ssrc: RtpSsrc) -> usize {
        self.streams.get(&ssrc).map(VecDeque::len).unwrap_or(0)
    }

    /// Total number of buffered frames.
    pub fn len(&self) -> usize {
        self.streams.values().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.values().all(VecDeque::is_empty)
    }

    /// Drop everything (session release).
    pub fn clear(&mut self) {
        self.streams.clear();
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FRAMES_PER_STREAM)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::RtpHeader;
    use bytes::Bytes;

    fn frame(ssrc: u32, seq: u16) -> BufferedFrame {
        BufferedFrame {
            packet: RtpPacket::new(
                RtpHeader::new(96, seq, seq as u32 * 960, ssrc),
                Bytes::from_static(b"payload"),
            ),
            gain: 50,
        }
    }

    #[test]
    fn test_one_frame_per_ssrc_per_tick() {
        let mut buffer = FrameBuffer::default();
        for seq in 0..3 {
            buffer.insert(frame(1, seq));
            buffer.insert(frame(2, seq));
        }

        let tick = buffer.take_tick();
        assert_eq!(tick.len(), 2);
        let seqs: Vec<u16> = tick.iter().map(|f| f.packet.header.sequence_number).collect();
        assert!(seqs.iter().all(|&s| s == 0));
        assert_eq!(buffer.queued(1), 2);
        assert_eq!(buffer.queued(2), 2);
    }

    #[test]
    fn test_oldest_first() {
        let mut buffer = FrameBuffer::default();
        buffer.insert(frame(7, 10));
        buffer.insert(frame(7, 11));

        assert_eq!(buffer.take_tick()[0].packet.header.sequence_number, 10);
        assert_eq!(buffer.take_tick()[0].packet.header.sequence_number, 11);
        assert!(buffer.take_tick().is_empty());
    }

    #[test]
    fn test_full_ring_evicts_oldest() {
        let mut buffer = FrameBuffer::new(3);
        for seq in 0..3 {
            assert!(buffer.insert(frame(9, seq)).is_none());
        }
        let evicted = buffer.insert(frame(9, 3)).expect("eviction");
        assert_eq!(evicted.packet.header.sequence_number, 0);
        assert_eq!(buffer.queued(9), 3);
        assert_eq!(buffer.take_tick()[0].packet.header.sequence_number, 1);
    }

    #[test]
    fn test_clear() {
        let mut buffer = FrameBuffer::default();
        buffer.insert(frame(1, 0));
        buffer.insert(frame(2, 0));
        buffer.clear();
        assert!(buffer.is_empty());
        assert!(buffer.take_tick().is_empty());
    }

    #[test]
    fn test_gain_travels_with_frame() {
        let mut buffer = FrameBuffer::default();
        let mut f = frame(4, 0);
        f.gain = 85;
        buffer.insert(f);
        assert_eq!(buffer.take_tick()[0].gain, 85);
    }
}
