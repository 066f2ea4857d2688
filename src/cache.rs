use std::fmt::Display;
use std::hash::Hash;
use std::num::NonZeroUsize;

use lru::LruCache;

/// In-memory mapping from record identity to a decoded payload.
///
/// The cache lives as long as the process and is never persisted. By
/// default it grows without bound; a bounded cache evicts the least
/// recently used entry when a new key would exceed its capacity.
pub struct KeyedCache<K, V> {
    /// Label for logging
    label: String,
    entries: LruCache<K, V>,
}

impl<K, V> KeyedCache<K, V>
where
    K: Hash + Eq + Clone + Display,
    V: Clone,
{
    /// Creates a cache without an eviction policy.
    pub fn unbounded(label: String) -> Self {
        log::debug!("cache/{}: initialized without limit", label);
        Self {
            label,
            entries: LruCache::unbounded(),
        }
    }

    /// Creates a cache holding at most `capacity` entries.
    pub fn bounded(label: String, capacity: NonZeroUsize) -> Self {
        log::debug!(
            "cache/{}: initialized with {} entries limit",
            label,
            capacity
        );
        Self {
            label,
            entries: LruCache::new(capacity),
        }
    }

    /// Retrieves a value by its key and marks it as recently used.
    pub fn get(&mut self, key: &K) -> Option<V> {
        match self.entries.get(key) {
            Some(value) => {
                log::trace!("cache/{}: hit for key {}", self.label, key);
                Some(value.clone())
            }
            None => {
                log::trace!("cache/{}: miss for key {}", self.label, key);
                None
            }
        }
    }

    /// Stores a value, replacing any previous value for the same key.
    pub fn put(&mut self, key: K, value: V) {
        log::debug!("cache/{}: set key={}", self.label, key);
        if let Some((evicted, _)) = self.entries.push(key.clone(), value) {
            if evicted != key {
                log::debug!(
                    "cache/{}: evicted key={} to make room",
                    self.label,
                    evicted
                );
            }
        }
    }

    /// Checks for a key without touching the recency order.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        log::debug!("cache/{}: cleared", self.label);
        self.entries.clear();
    }
}
