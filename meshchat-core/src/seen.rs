//! Seen-message cache: bounded record of message IDs already observed, used to stop flood loops.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::identity::MessageId;

/// Default number of retained IDs. Generous so that slow multi-hop relays are still caught.
pub const DEFAULT_SEEN_CAPACITY: usize = 65_536;

/// Default retention for an ID.
pub const DEFAULT_SEEN_MAX_AGE: Duration = Duration::from_secs(10 * 60);

/// Message IDs with first-seen time. Evicts oldest-first once past capacity or max age.
#[derive(Debug)]
pub struct SeenCache {
    entries: HashMap<MessageId, Instant>,
    order: VecDeque<(MessageId, Instant)>,
    capacity: usize,
    max_age: Duration,
}

impl SeenCache {
    pub fn new(capacity: usize, max_age: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
            max_age,
        }
    }

    /// True the first time `id` is seen (and records it); false for a duplicate.
    pub fn observe(&mut self, id: &MessageId) -> bool {
        self.observe_at(id, Instant::now())
    }

    /// `observe` with an explicit clock reading.
    pub fn observe_at(&mut self, id: &MessageId, now: Instant) -> bool {
        self.evict_expired(now);
        if self.entries.contains_key(id) {
            return false;
        }
        self.entries.insert(id.clone(), now);
        self.order.push_back((id.clone(), now));
        while self.order.len() > self.capacity {
            if let Some((old, _)) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
        true
    }

    pub fn contains(&self, id: &MessageId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_expired(&mut self, now: Instant) {
        while let Some((_, inserted)) = self.order.front() {
            if now.saturating_duration_since(*inserted) < self.max_age {
                break;
            }
            if let Some((old, _)) = self.order.pop_front() {
                self.entries.remove(&old);
            }
        }
    }
}

impl Default for SeenCache {
    fn default() -> Self {
        Self::new(DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_MAX_AGE)
    }
}
