//! Backend registry
//!
//! Bookkeeping of mixer workers and their session assignments: a slot
//! table indexed by connection slot and a session index pointing back
//! into it. Each live slot is either free or bound to exactly one
//! session id, and each session id appears at most once.

use std::collections::HashMap;
use std::net::SocketAddr;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Snapshot of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MixerDescriptor {
    pub slot: usize,
    pub uuid: Uuid,
    pub session: Option<String>,
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    live: bool,
    uuid: Option<Uuid>,
    session: Option<String>,
    addr: Option<SocketAddr>,
}

/// Registry of mixer workers and their session assignments.
pub struct MixerRegistry {
    slots: Vec<Slot>,
    sessions: HashMap<String, usize>,
}

impl MixerRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![Slot::default(); capacity],
            sessions: HashMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Mark `slot` live and free for assignment.
    pub fn register_mixer(
        &mut self,
        slot: usize,
        uuid: Uuid,
        addr: Option<SocketAddr>,
    ) -> Result<()> {
        let entry = self
            .slots
            .get_mut(slot)
            .ok_or_else(|| Error::Registry(format!("slot {} out of range", slot)))?;
        if entry.live {
            return Err(Error::Registry(format!("slot {} already live", slot)));
        }
        *entry = Slot {
            live: true,
            uuid: Some(uuid),
            session: None,
            addr,
        };
        Ok(())
    }

    /// Reclaim `slot`. Returns the session id that was bound to it, if
    /// any, so the caller can surface `mixer_lost`.
    pub fn unregister_mixer(&mut self, slot: usize) -> Option<String> {
        let entry = self.slots.get_mut(slot)?;
        let orphaned = entry.session.take();
        if let Some(session) = &orphaned {
            self.sessions.remove(session);
        }
        *entry = Slot::default();
        orphaned
    }

    /// Bind `session` to any free live slot. Idempotent for a session
    /// that is already bound.
    pub fn acquire(&mut self, session: &str) -> Option<usize> {
        if let Some(&slot) = self.sessions.get(session) {
            return Some(slot);
        }
        let slot = self
            .slots
            .iter()
            .position(|s| s.live && s.session.is_none())?;
        self.slots[slot].session = Some(session.to_string());
        self.sessions.insert(session.to_string(), slot);
        Some(slot)
    }

    /// Unbind `session`, keeping its slot live and free.
    pub fn release(&mut self, session: &str) -> bool {
        match self.sessions.remove(session) {
            Some(slot) => {
                self.slots[slot].session = None;
                true
            }
            None => false,
        }
    }

    pub fn get_by_session(&self, session: &str) -> Option<MixerDescriptor> {
        let slot = *self.sessions.get(session)?;
        self.get_by_slot(slot)
    }

    pub fn get_by_slot(&self, slot: usize) -> Option<MixerDescriptor> {
        let entry = self.slots.get(slot)?;
        if !entry.live {
            return None;
        }
        Some(MixerDescriptor {
            slot,
            uuid: entry.uuid?,
            session: entry.session.clone(),
            addr: entry.addr,
        })
    }

    /// `(live, bound)` counts.
    pub fn count(&self) -> (usize, usize) {
        let live = self.slots.iter().filter(|s| s.live).count();
        let bound = self
            .slots
            .iter()
            .filter(|s| s.live && s.session.is_some())
            .count();
        (live, bound)
    }
}
