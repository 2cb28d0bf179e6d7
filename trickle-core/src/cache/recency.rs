//! Bounded least-recently-used map
//!
//! Unlike `lru::LruCache` on its own, capacity may be zero and every
//! eviction is reported back to the caller so it can notify whoever owns
//! the evicted data.

use std::hash::Hash;

use lru::LruCache;

/// Key/value store holding at most `capacity` entries.
///
/// The least recently inserted or read entry is always the next one evicted.
pub struct RecencyCache<K, V> {
    entries: LruCache<K, V>,
    capacity: usize,
}

impl<K: Hash + Eq + Clone, V> RecencyCache<K, V> {
    /// Creates an empty cache.
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: LruCache::unbounded(),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Checks for `key` without touching its recency.
    pub fn has(&self, key: &K) -> bool {
        self.entries.contains(key)
    }

    /// Reads `key` without touching its recency.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries.peek(key)
    }

    /// Reads `key` and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        self.entries.get(key)
    }

    /// Inserts or updates `key`, returning the key evicted to make room.
    ///
    /// Updating an existing key never evicts. At capacity zero the new
    /// entry is inserted and immediately evicted, so its own key is returned.
    pub fn put(&mut self, key: K, value: V) -> Option<K> {
        if self.entries.contains(&key) {
            self.entries.push(key, value);
            return None;
        }

        let mut evicted = None;
        if self.entries.len() >= self.capacity {
            evicted = self.entries.pop_lru().map(|(key, _)| key);
        }

        self.entries.push(key, value);

        if self.entries.len() > self.capacity {
            evicted = self.entries.pop_lru().map(|(key, _)| key);
        }

        evicted
    }

    /// Removes every entry, returning keys least recently used first.
    pub fn clear(&mut self) -> Vec<K> {
        let mut evicted = Vec::with_capacity(self.entries.len());
        while let Some((key, _)) = self.entries.pop_lru() {
            evicted.push(key);
        }
        evicted
    }

    /// Changes capacity, evicting the least recently used entries that no
    /// longer fit. Returns evicted keys in eviction order.
    pub fn set_capacity(&mut self, capacity: usize) -> Vec<K> {
        self.capacity = capacity;

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            match self.entries.pop_lru() {
                Some((key, _)) => evicted.push(key),
                None => break,
            }
        }
        evicted
    }

    /// Iterates entries from least to most recently used.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries.iter().rev()
    }
}
