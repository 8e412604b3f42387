//! Bucket-state storage for the rate limiter.
//!
//! [`TokenStore`] is the shared, multi-writer source of truth (multiple server
//! instances may point at the same backend). [`FallbackBuckets`] is the
//! per-instance local mirror used only while the shared store is unreachable;
//! its entries carry their own TTL and expire independently so a long outage
//! cannot grow memory without bound. Fallback state is never authoritative
//! once the shared store recovers: the next admit simply reads the shared
//! value again.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Abstract storage interface for shared bucket state.
///
/// Designed for both in-memory and distributed backends. The value model is
/// `(tokens, last_updated_millis)` per bucket key; atomicity is the store's
/// responsibility via compare-and-set, not the client's.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Error type for storage operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fetch the current state for a key. Returns `(tokens, last_updated_millis)`.
    async fn get_state(&self, key: &str) -> Result<Option<(f64, u64)>, Self::Error>;

    /// Update the state for a key with compare-and-set semantics.
    ///
    /// * `prev_updated_at`: the timestamp read before computing the new state
    ///   (optimistic locking); `None` implies an unconditional or first write.
    ///
    /// Returns `Ok(true)` if the update committed, `Ok(false)` if another
    /// writer raced (the caller should re-read and retry).
    async fn set_state(
        &self,
        key: &str,
        tokens: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> Result<bool, Self::Error>;
}

/// Simple in-memory token store, suitable for single-instance deployments and
/// tests.
#[derive(Default, Clone, Debug)]
pub struct InMemoryTokenStore {
    // key -> (tokens, last_updated_millis)
    data: Arc<Mutex<HashMap<String, (f64, u64)>>>,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    type Error = std::convert::Infallible;

    async fn get_state(&self, key: &str) -> Result<Option<(f64, u64)>, Self::Error> {
        let guard = self.data.lock().unwrap();
        Ok(guard.get(key).copied())
    }

    async fn set_state(
        &self,
        key: &str,
        tokens: f64,
        updated_at: u64,
        prev_updated_at: Option<u64>,
    ) -> Result<bool, Self::Error> {
        let mut guard = self.data.lock().unwrap();

        if let Some(prev) = prev_updated_at {
            // A missing key commits unconditionally: the caller read "absent"
            // and is seeding the bucket.
            if let Some(&(_, current_ts)) = guard.get(key) {
                if current_ts != prev {
                    return Ok(false);
                }
            }
        }

        guard.insert(key.to_string(), (tokens, updated_at));
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy)]
struct FallbackEntry {
    tokens: f64,
    updated_at: u64,
    expires_at: u64,
}

/// Capacity- and TTL-bounded local mirror of bucket state.
#[derive(Debug)]
pub struct FallbackBuckets {
    entries: Mutex<HashMap<String, FallbackEntry>>,
    max_size: usize,
    ttl: Duration,
}

impl FallbackBuckets {
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), max_size, ttl }
    }

    /// Fetch a live mirrored bucket, dropping it if its TTL has lapsed.
    pub fn get(&self, key: &str, now_millis: u64) -> Option<(f64, u64)> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires_at <= now_millis => {
                entries.remove(key);
                None
            }
            Some(entry) => Some((entry.tokens, entry.updated_at)),
            None => None,
        }
    }

    /// Store a mirrored bucket. Returns `false` if the mirror is full even
    /// after purging expired entries; live buckets are never evicted, since
    /// dropping one would silently reset that caller's limit.
    pub fn put(&self, key: &str, tokens: f64, updated_at: u64, now_millis: u64) -> bool {
        let expires_at =
            now_millis.saturating_add(u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX));
        let mut entries = self.entries.lock().unwrap();

        if let Some(entry) = entries.get_mut(key) {
            *entry = FallbackEntry { tokens, updated_at, expires_at };
            return true;
        }

        if entries.len() >= self.max_size {
            entries.retain(|_, e| e.expires_at > now_millis);
        }
        if entries.len() >= self.max_size {
            return false;
        }

        entries.insert(key.to_string(), FallbackEntry { tokens, updated_at, expires_at });
        true
    }

    /// Number of live mirrored buckets.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all mirrored state (used when the shared store recovers).
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}
