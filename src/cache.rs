//! Bounded result cache with LRU eviction and per-entry TTL.
//!
//! The cache exclusively owns its entries; `get` hands out clones, never
//! references, so invalidation can drop entries at any time. Expiry is checked
//! lazily at read time. Keys follow a `"cache:<route>"` convention so that
//! mutating operations can invalidate whole cached collections by substring,
//! e.g. `invalidate("sessions")` drops both `cache:/api/sessions/active` and
//! `cache:/api/sessions/stats`.
//!
//! Eviction rules:
//! - reading an entry moves it to the most-recent position;
//! - writing a new key at capacity evicts exactly the single oldest entry;
//! - writing an existing key updates in place and never evicts.

use crate::clock::{Clock, MonotonicClock};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Errors returned by cache configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("cache capacity must be > 0")]
    InvalidCapacity,
}

/// Read-only counters for operational dashboards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub size: usize,
    pub max_size: usize,
}

#[derive(Debug)]
struct CacheEntry<V> {
    value: V,
    expires_at: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, CacheEntry<V>>,
    // Front = least recently used, back = most recently used.
    order: VecDeque<String>,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, key: &str) {
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            if let Some(k) = self.order.remove(pos) {
                self.order.push_back(k);
            }
        }
    }

    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        if let Some(pos) = self.order.iter().position(|k| k == key) {
            self.order.remove(pos);
        }
    }
}

/// Capacity- and time-bounded key/value store.
#[derive(Debug)]
pub struct BoundedCache<V> {
    inner: Mutex<CacheInner<V>>,
    max_size: usize,
    clock: Arc<dyn Clock>,
}

impl<V: Clone> BoundedCache<V> {
    /// Create a cache holding at most `max_size` entries.
    pub fn new(max_size: usize) -> Result<Self, CacheError> {
        if max_size == 0 {
            return Err(CacheError::InvalidCapacity);
        }
        Ok(Self {
            inner: Mutex::new(CacheInner { entries: HashMap::new(), order: VecDeque::new() }),
            max_size,
            clock: Arc::new(MonotonicClock::default()),
        })
    }

    /// Override the clock (useful for deterministic TTL tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Fetch a value. Expired entries are treated as absent and removed; a hit
    /// refreshes the entry's recency.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now_millis();
        let mut inner = self.inner.lock().unwrap();

        let live = match inner.entries.get(key) {
            None => return None,
            Some(entry) if entry.expires_at <= now => None,
            Some(entry) => Some(entry.value.clone()),
        };

        match live {
            None => {
                inner.remove(key);
                None
            }
            Some(value) => {
                inner.touch(key);
                Some(value)
            }
        }
    }

    /// Insert or update an entry with the given time-to-live.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let expires_at = self
            .clock
            .now_millis()
            .saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX));
        let mut inner = self.inner.lock().unwrap();

        // Update in place: refresh recency, never evict.
        if let Some(entry) = inner.entries.get_mut(&key) {
            entry.value = value;
            entry.expires_at = expires_at;
            inner.touch(&key);
            return;
        }

        if inner.entries.len() >= self.max_size {
            if let Some(oldest) = inner.order.pop_front() {
                inner.entries.remove(&oldest);
                tracing::debug!(key = %oldest, "cache full, evicted least recently used entry");
            }
        }

        inner.order.push_back(key.clone());
        inner.entries.insert(key, CacheEntry { value, expires_at });
    }

    /// Remove every entry whose key contains the given substring.
    /// Returns the number of entries removed.
    pub fn invalidate(&self, pattern: &str) -> usize {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let before = inner.entries.len();
        inner.entries.retain(|key, _| !key.contains(pattern));
        let entries = &inner.entries;
        inner.order.retain(|key| entries.contains_key(key));
        before - inner.entries.len()
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
    }

    /// Current size and configured capacity.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        CacheStats { size: inner.entries.len(), max_size: self.max_size }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    const TTL: Duration = Duration::from_secs(60);

    #[test]
    fn rejects_zero_capacity() {
        let err = BoundedCache::<String>::new(0).unwrap_err();
        assert_eq!(err, CacheError::InvalidCapacity);
    }

    #[test]
    fn get_returns_inserted_value() {
        let cache = BoundedCache::new(10).unwrap();
        cache.set("cache:/api/sessions/abc", "payload".to_string(), TTL);
        assert_eq!(cache.get("cache:/api/sessions/abc").as_deref(), Some("payload"));
        assert_eq!(cache.get("cache:/api/sessions/missing"), None);
    }

    #[test]
    fn reading_refreshes_recency_before_eviction() {
        let cache = BoundedCache::new(2).unwrap();
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);

        // Reading A makes B the oldest; inserting C must evict B, not A.
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, TTL);

        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn updating_existing_key_never_evicts() {
        let cache = BoundedCache::new(2).unwrap();
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);

        cache.set("a", 10, TTL);

        assert_eq!(cache.stats().size, 2);
        assert_eq!(cache.get("a"), Some(10));
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn expired_entries_are_absent_and_removed() {
        let clock = ManualClock::new();
        let cache = BoundedCache::new(10).unwrap().with_clock(clock.clone());

        cache.set("k", 1, Duration::from_millis(100));
        assert_eq!(cache.get("k"), Some(1));

        clock.advance(100);
        assert_eq!(cache.get("k"), None);
        assert_eq!(cache.stats().size, 0, "expired entry is removed on read");
    }

    #[test]
    fn invalidate_removes_matching_keys() {
        let cache = BoundedCache::new(10).unwrap();
        cache.set("cache:/api/sessions/active", 1, TTL);
        cache.set("cache:/api/sessions/stats", 2, TTL);
        cache.set("cache:/api/templates", 3, TTL);

        let removed = cache.invalidate("sessions");

        assert_eq!(removed, 2);
        assert_eq!(cache.get("cache:/api/sessions/active"), None);
        assert_eq!(cache.get("cache:/api/sessions/stats"), None);
        assert_eq!(cache.get("cache:/api/templates"), Some(3));
    }

    #[test]
    fn invalidated_keys_free_capacity() {
        let cache = BoundedCache::new(2).unwrap();
        cache.set("sessions:a", 1, TTL);
        cache.set("sessions:b", 2, TTL);
        cache.invalidate("sessions");

        cache.set("x", 3, TTL);
        cache.set("y", 4, TTL);
        assert_eq!(cache.get("x"), Some(3));
        assert_eq!(cache.get("y"), Some(4));
    }

    #[test]
    fn clear_and_stats() {
        let cache = BoundedCache::new(5).unwrap();
        cache.set("a", 1, TTL);
        cache.set("b", 2, TTL);
        assert_eq!(cache.stats(), CacheStats { size: 2, max_size: 5 });

        cache.clear();
        assert_eq!(cache.stats(), CacheStats { size: 0, max_size: 5 });
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn size_never_exceeds_capacity() {
        let cache = BoundedCache::new(3).unwrap();
        for i in 0..50 {
            cache.set(format!("key-{}", i), i, TTL);
            assert!(cache.stats().size <= 3);
        }
    }
}
