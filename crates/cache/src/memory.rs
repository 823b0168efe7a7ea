//! In-memory LRU cache with per-entry expiry.

use std::{num::NonZeroUsize, time::Duration};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::time::Instant;

/// Capacity used when zero is requested.
const FALLBACK_CAPACITY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(capacity) => capacity,
    None => NonZeroUsize::MIN,
};

/// Entry in the memory cache.
struct CacheEntry {
    value: Value,
    expires_at: Instant,
}

/// In-memory LRU cache of JSON values.
pub struct MemoryCache {
    cache: Mutex<LruCache<String, CacheEntry>>,
}

impl MemoryCache {
    /// Create a new memory cache with the given capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(FALLBACK_CAPACITY);
        Self { cache: Mutex::new(LruCache::new(cap)) }
    }

    /// Get a live entry. Expired entries are dropped on access.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut cache = self.cache.lock();
        if let Some(entry) = cache.get(key) {
            if entry.expires_at > Instant::now() {
                return Some(entry.value.clone());
            }
            cache.pop(key);
        }
        None
    }

    /// Insert or replace an entry.
    pub fn put(&self, key: &str, value: Value, ttl: Duration) {
        let entry = CacheEntry { value, expires_at: Instant::now() + ttl };
        self.cache.lock().put(key.to_string(), entry);
    }

    /// Remove an entry.
    pub fn delete(&self, key: &str) {
        self.cache.lock().pop(key);
    }

    /// Remove every entry whose key satisfies `predicate`. Returns how many
    /// were removed.
    pub fn delete_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut cache = self.cache.lock();
        let doomed: Vec<String> =
            cache.iter().filter(|(key, _)| predicate(key)).map(|(key, _)| key.clone()).collect();
        for key in &doomed {
            cache.pop(key);
        }
        doomed.len()
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.cache.lock().clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache").field("len", &self.len()).finish_non_exhaustive()
    }
}
