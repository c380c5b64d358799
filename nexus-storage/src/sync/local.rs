//! In-process view of recently used records.
//!
//! Two maps keyed by [`StateKey`]:
//!
//! - entries: records this node read or wrote, each with an expiry
//! - fences: the highest revision this node has heard of per key, and whether
//!   that revision was a delete
//!
//! A record below its key's fence is never admitted. This is what keeps a
//! deleted value from coming back through a slow read or a stale cache entry.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use nexus_core::{Revision, StateKey, StateRecord};
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct LocalEntry {
    record: StateRecord,
    expires_at: Instant,
}

#[derive(Debug, Clone, Copy)]
struct Fence {
    revision: Revision,
    deleted: bool,
    expires_at: Instant,
}

/// Why [`LocalView::fence_with`] did or did not move the fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceUpdate {
    Advanced,
    Stale,
}

#[derive(Debug)]
pub struct LocalView {
    entries: DashMap<StateKey, LocalEntry>,
    fences: DashMap<StateKey, Fence>,
    entry_ttl: Duration,
    fence_ttl: Duration,
    capacity: usize,
}

impl LocalView {
    pub fn new(entry_ttl: Duration, fence_ttl: Duration, capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            fences: DashMap::new(),
            entry_ttl,
            fence_ttl,
            capacity,
        }
    }

    /// Live, unexpired record for `key`.
    pub fn get(&self, key: &StateKey) -> Option<StateRecord> {
        let entry = self.entries.get(key)?;
        if Instant::now() < entry.expires_at {
            return Some(entry.record.clone());
        }
        drop(entry);
        self.entries
            .remove_if(key, |_, e| Instant::now() >= e.expires_at);
        None
    }

    /// Whether a record at `revision` is at least as new as everything this
    /// node has heard about `key`.
    pub fn admits(&self, key: &StateKey, revision: Revision) -> bool {
        match self.fences.get(key) {
            Some(fence) if Instant::now() < fence.expires_at => {
                revision > fence.revision || (revision == fence.revision && !fence.deleted)
            }
            _ => true,
        }
    }

    /// Whether a cached tombstone at `revision` is still current.
    pub fn tombstone_current(&self, key: &StateKey, revision: Revision) -> bool {
        match self.fences.get(key) {
            Some(fence) if Instant::now() < fence.expires_at => fence.revision <= revision,
            _ => true,
        }
    }

    /// Remember `record` unless something newer is already known.
    pub fn remember(&self, record: &StateRecord) {
        if !self.admits(&record.key, record.revision) {
            return;
        }
        if !self.entries.contains_key(&record.key) && self.entries.len() >= self.capacity {
            self.evict_expired();
            if self.entries.len() >= self.capacity {
                return;
            }
        }

        let fresh = LocalEntry {
            record: record.clone(),
            expires_at: Instant::now() + self.entry_ttl,
        };
        match self.entries.entry(record.key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if current.record.revision <= record.revision
                    || Instant::now() >= current.expires_at
                {
                    occupied.insert(fresh);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
    }

    /// Move the fence for `key` up to `revision`.
    pub fn fence_with(&self, key: &StateKey, revision: Revision, deleted: bool) -> FenceUpdate {
        if !self.fences.contains_key(key) && self.fences.len() >= self.capacity {
            let now = Instant::now();
            self.fences.retain(|_, fence| now < fence.expires_at);
        }

        let now = Instant::now();
        let fresh = Fence {
            revision,
            deleted,
            expires_at: now + self.fence_ttl,
        };
        match self.fences.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                if now < current.expires_at && current.revision >= revision {
                    return FenceUpdate::Stale;
                }
                occupied.insert(fresh);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
            }
        }
        FenceUpdate::Advanced
    }

    /// Drop the record for `key`. Returns whether one was held.
    pub fn forget(&self, key: &StateKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop the record for `key` if it is older than `revision`.
    pub fn forget_below(&self, key: &StateKey, revision: Revision) -> bool {
        self.entries
            .remove_if(key, |_, entry| entry.record.revision < revision)
            .is_some()
    }

    /// Drop every record. Fences are kept.
    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| now < entry.expires_at);
    }
}

// =============================================================================
// TESTS
// =============================================================================
