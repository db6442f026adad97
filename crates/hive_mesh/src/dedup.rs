//! Broadcast deduplication using two-set rotation.
//!
//! Only consulted when `MeshConfig::broadcast_dedup` is on. When the current
//! set grows past half the capacity it becomes the previous set and a new
//! empty set starts; both are checked.

use std::collections::HashSet;

use crate::identity::PeerId;

/// Identity of one broadcast: its origin and the origin router's broadcast
/// sequence.
pub type BroadcastKey = (PeerId, u64);

#[derive(Debug)]
pub struct SeenBroadcasts {
    current: HashSet<BroadcastKey>,
    prev: HashSet<BroadcastKey>,
    rotate_at: usize,
}

impl SeenBroadcasts {
    pub fn new(capacity: usize) -> Self {
        Self {
            current: HashSet::new(),
            prev: HashSet::new(),
            rotate_at: (capacity / 2).max(1),
        }
    }

    pub fn contains(&self, key: &BroadcastKey) -> bool {
        self.current.contains(key) || self.prev.contains(key)
    }

    /// Insert a key; returns `true` if it was not seen before.
    pub fn insert(&mut self, key: BroadcastKey) -> bool {
        if self.contains(&key) {
            return false;
        }
        self.current.insert(key);
        if self.current.len() > self.rotate_at {
            self.prev = std::mem::take(&mut self.current);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.current.len() + self.prev.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_empty() && self.prev.is_empty()
    }
}
