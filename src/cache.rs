//! TTL-keyed in-memory object store
//!
//! The cache backs two consumers: the fetcher stores upstream payload bytes
//! under resource names, and the index renderer stores finished responses
//! under request paths. Readers proceed in parallel; a writer is exclusive.
//! Entries are unbounded by design (no LRU); an expired entry reads as
//! missing but is not eagerly purged.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A single cached value with its optional expiry instant.
#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    /// `None` never expires.
    expire_at: Option<Instant>,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        match self.expire_at {
            Some(at) => now >= at,
            None => false,
        }
    }
}

/// Thread-safe TTL cache.
///
/// `get` is O(1). A non-positive TTL means the entry never expires.
#[derive(Debug, Default)]
pub struct Cache<V> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> Cache<V> {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the value under `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read();
        let entry = entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            return None;
        }
        Some(entry.value.clone())
    }

    /// Stores `value` under `key` for `ttl_secs` seconds. A TTL of zero or
    /// less means the entry never expires. Overwrites any previous entry.
    pub fn set(&self, key: impl Into<String>, value: V, ttl_secs: i64) {
        let expire_at = if ttl_secs > 0 {
            Some(Instant::now() + Duration::from_secs(ttl_secs as u64))
        } else {
            None
        };
        self.entries
            .write()
            .insert(key.into(), CacheEntry { value, expire_at });
    }

    /// Removes the entry under `key`, if any.
    pub fn remove(&self, key: &str) {
        self.entries.write().remove(key);
    }

    /// Drops every entry.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    /// Number of stored entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// True when no entries are stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
