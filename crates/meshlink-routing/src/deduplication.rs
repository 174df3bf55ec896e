//! Message cache for duplicate suppression
//!
//! Flooding across a mesh with cycles delivers the same message many times.
//! Every inbound message id is checked here before any other processing.
//! The cache is bounded by count (least recently seen ids are dropped first)
//! and by age.

use lru::LruCache;
use meshlink_protocol::MessageId;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

/// Bounded set of recently seen message ids
#[derive(Debug)]
pub struct DeduplicationCache {
    seen: LruCache<MessageId, Instant>,
    ttl: Duration,
}

impl DeduplicationCache {
    /// Create a cache holding at most `capacity` ids for at most `ttl`
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        DeduplicationCache {
            seen: LruCache::new(capacity),
            ttl,
        }
    }

    fn is_live(&self, seen_at: Instant, now: Instant) -> bool {
        now.saturating_duration_since(seen_at) < self.ttl
    }

    /// True if `id` was seen within the TTL
    pub fn has_seen(&self, id: &MessageId, now: Instant) -> bool {
        self.seen
            .peek(id)
            .is_some_and(|seen_at| self.is_live(*seen_at, now))
    }

    /// Record `id` as seen
    pub fn mark_seen(&mut self, id: MessageId, now: Instant) {
        self.seen.put(id, now);
    }

    /// True the first time an id is offered, false for every repeat
    ///
    /// Repeats do not refresh the entry, so an id stops being suppressed
    /// once its TTL has passed since first sight.
    pub fn should_process(&mut self, id: MessageId, now: Instant) -> bool {
        if self.has_seen(&id, now) {
            return false;
        }
        self.mark_seen(id, now);
        true
    }

    /// Drop ids older than the TTL
    pub fn cleanup_expired(&mut self, now: Instant) -> usize {
        let expired: Vec<MessageId> = self
            .seen
            .iter()
            .filter(|(_, seen_at)| !self.is_live(**seen_at, now))
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.seen.pop(id);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
    }
}
