//! Per-SSRC stream table
//!
//! One entry per incoming synchronization source: a stateful decoder, the
//! voice latch for fade in/out and the timestamp the garbage collector
//! uses to reclaim sources that stopped sending.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use tracing::trace;

use crate::codec::OpusDecoder;
use crate::error::Result;
use loopcast_rtp_core::RtpSsrc;

pub(crate) struct RtpStreamEntry {
    pub decoder: OpusDecoder,
    pub voice_detected: bool,
    pub last_used_epoch_secs: u64,
}

pub(crate) struct StreamTable {
    sample_rate_hz: u32,
    entries: HashMap<RtpSsrc, RtpStreamEntry>,
}

impl StreamTable {
    pub fn new(sample_rate_hz: u32) -> Self {
        Self {
            sample_rate_hz,
            entries: HashMap::new(),
        }
    }

    /// Change the decode rate. Existing decoders are dropped; they will be
    /// recreated lazily at the new rate.
    pub fn set_sample_rate(&mut self, sample_rate_hz: u32) {
        if self.sample_rate_hz != sample_rate_hz {
            self.sample_rate_hz = sample_rate_hz;
            self.entries.clear();
        }
    }

    /// Look up the entry for `ssrc`, creating it lazily, and touch its GC
    /// timestamp.
    pub fn entry_mut(&mut self, ssrc: RtpSsrc, now_epoch_secs: u64) -> Result<&mut RtpStreamEntry> {
        match self.entries.entry(ssrc) {
            Entry::Occupied(occupied) => {
                let entry = occupied.into_mut();
                entry.last_used_epoch_secs = now_epoch_secs;
                Ok(entry)
            }
            Entry::Vacant(vacant) => {
                trace!(ssrc, "new RTP stream");
                Ok(vacant.insert(RtpStreamEntry {
                    decoder: OpusDecoder::new(self.sample_rate_hz)?,
                    voice_detected: false,
                    last_used_epoch_secs: now_epoch_secs,
                }))
            }
        }
    }

    /// Remove entries idle for longer than `max_idle_secs`.
    pub fn gc(&mut self, now_epoch_secs: u64, max_idle_secs: u64) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_epoch_secs.saturating_sub(e.last_used_epoch_secs) <= max_idle_secs);
        before - self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lazy_creation_single_entry_per_ssrc() {
        let mut table = StreamTable::new(48000);
        table.entry_mut(7, 100).unwrap();
        table.entry_mut(7, 101).unwrap();
        table.entry_mut(8, 101).unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_gc_reclaims_idle_entries() {
        let mut table = StreamTable::new(48000);
        table.entry_mut(1, 0).unwrap();
        table.entry_mut(2, 250).unwrap();

        // entry 1 is 400 s idle, entry 2 only 150 s
        assert_eq!(table.gc(400, 300), 1);
        assert_eq!(table.len(), 1);
        assert!(table.entry_mut(2, 401).is_ok());
    }

    #[test]
    fn test_use_resets_gc_timer() {
        let mut table = StreamTable::new(48000);
        table.entry_mut(1, 0).unwrap();
        table.entry_mut(1, 350).unwrap();
        assert_eq!(table.gc(400, 300), 0);
    }

    #[test]
    fn test_voice_latch_persists() {
        let mut table = StreamTable::new(48000);
        table.entry_mut(9, 0).unwrap().voice_detected = true;
        assert!(table.entry_mut(9, 1).unwrap().voice_detected);
    }
}
