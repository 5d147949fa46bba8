//! # Bounded Idempotency Cache
//!
//! Maps committed event ids to the event number they were committed at, so a
//! retried write can be answered without being replicated again.
//!
//! ## Eviction Order
//!
//! The cache holds at most `capacity` entries and evicts the **oldest
//! inserted** entry first. Lookups use `LruCache::peek`, which does not touch
//! recency, so a hot key is not kept alive by being read; only (re)recording
//! refreshes an entry.
//!
//! ## Rust Pattern: Interior Mutability
//!
//! The cache is shared as `Arc<IdempotencyCache>` between the request service
//! and anything else that wants to consult it, so its methods take `&self` and
//! guard the `LruCache` with a `std::sync::Mutex`. Critical sections are a
//! single hash-map operation; nothing awaits while holding the lock.
//!
//! Staleness is accepted: a retry that arrives before the `EventCommitted`
//! signal is recorded will miss and be replicated again.

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;

use crate::types::{EventId, EventNumber};

/// Default capacity: one million committed event ids.
pub const DEFAULT_IDEMPOTENCY_CAPACITY: usize = 1_000_000;

/// Event id → committed event number, bounded.
#[derive(Debug)]
pub struct IdempotencyCache {
    entries: Mutex<LruCache<EventId, EventNumber>>,
}

impl IdempotencyCache {
    /// Creates a cache holding at most `capacity` entries.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Records that `event_id` committed at `event_number`.
    ///
    /// Overwrites silently if the id is already present.
    pub fn record(&self, event_id: EventId, event_number: EventNumber) {
        self.lock().put(event_id, event_number);
    }

    /// Returns the committed event number for `event_id`, if still cached.
    pub fn lookup(&self, event_id: &EventId) -> Option<EventNumber> {
        self.lock().peek(event_id).copied()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.lock().cap().get()
    }

    /// A poisoned lock only means another thread panicked mid-`put`; the map
    /// itself is still a valid cache, so keep using it.
    fn lock(&self) -> MutexGuard<'_, LruCache<EventId, EventNumber>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for IdempotencyCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_IDEMPOTENCY_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache(capacity: usize) -> IdempotencyCache {
        IdempotencyCache::new(NonZeroUsize::new(capacity).unwrap())
    }

    #[test]
    fn test_record_and_lookup() {
        let cache = cache(4);
        let id = EventId::new();

        assert_eq!(cache.lookup(&id), None);
        cache.record(id, EventNumber::new(7));
        assert_eq!(cache.lookup(&id), Some(EventNumber::new(7)));
    }

    #[test]
    fn test_record_overwrites() {
        let cache = cache(4);
        let id = EventId::new();

        cache.record(id, EventNumber::new(1));
        cache.record(id, EventNumber::new(2));

        assert_eq!(cache.lookup(&id), Some(EventNumber::new(2)));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_evicts_oldest_inserted() {
        let cache = cache(3);
        let ids: Vec<EventId> = (0..4).map(|_| EventId::new()).collect();

        for (i, id) in ids.iter().take(3).enumerate() {
            cache.record(*id, EventNumber::new(i as i64));
        }

        // Reading the oldest entry must not save it from eviction.
        assert!(cache.lookup(&ids[0]).is_some());

        cache.record(ids[3], EventNumber::new(3));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.lookup(&ids[0]), None);
        assert_eq!(cache.lookup(&ids[1]), Some(EventNumber::new(1)));
        assert_eq!(cache.lookup(&ids[3]), Some(EventNumber::new(3)));
    }

    #[test]
    fn test_default_capacity() {
        let cache = IdempotencyCache::default();
        assert_eq!(cache.capacity(), DEFAULT_IDEMPOTENCY_CAPACITY);
        assert!(cache.is_empty());
    }
}
