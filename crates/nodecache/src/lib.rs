//! # NodeCache - Bounded LRU of Decoded Nodes
//!
//! Maps a node's log location to its decoded, immutable form. Shared by the
//! writer and every reader; internally synchronized.
//!
//! Nodes never change once written, so a cached value is never stale. The
//! only policy question is which entry to drop, and the answer is always the
//! least recently used one (ties cannot occur: every access moves the entry
//! to the front, so recency is a strict order consistent with insertion).
//!
//! Values are handed out as `Arc<V>`. A reader holding an `Arc` keeps its
//! node alive even if the cache evicts the entry meanwhile; eviction only
//! drops the cache's own reference.

use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;

/// Hit / miss / eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub len: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> Option<f64> {
        let total = self.hits.saturating_add(self.misses);
        if total == 0 {
            return None;
        }
        Some(self.hits as f64 / total as f64)
    }
}

/// Entry-count bounded LRU cache.
pub struct NodeCache<K: Eq + Hash, V> {
    inner: Mutex<LruCache<K, Arc<V>>>,
    capacity: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
}

impl<K: Eq + Hash, V> std::fmt::Debug for NodeCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeCache")
            .field("len", &self.inner.lock().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl<K: Eq + Hash + Clone, V> NodeCache<K, V> {
    /// Creates a cache holding at most `capacity` entries (at least one).
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// Looks `key` up and marks it most recently used.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let value = self.inner.lock().get(key).cloned();
        if value.is_some() {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        value
    }

    /// Inserts or refreshes `key`, evicting the least recently used entry
    /// when the cache is full.
    pub fn put(&self, key: K, value: Arc<V>) {
        let evicted = self.inner.lock().push(key.clone(), value);
        self.inserts.fetch_add(1, Ordering::Relaxed);
        // push returns the old pair on refresh, the evicted pair otherwise
        if matches!(evicted, Some((ref k, _)) if *k != key) {
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Returns the cached value or loads, caches and returns it.
    ///
    /// The loader runs without the cache lock held, so concurrent misses on
    /// the same key may both load; the later insert wins, which is harmless
    /// for immutable values.
    pub fn get_or_load<E, F>(&self, key: &K, load: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Result<V, E>,
    {
        if let Some(v) = self.get(key) {
            return Ok(v);
        }
        let v = Arc::new(load()?);
        self.put(key.clone(), v.clone());
        Ok(v)
    }

    /// Checks presence without touching recency or counters.
    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.inner.lock().pop(key)
    }

    /// Keys from most to least recently used.
    pub fn keys_by_recency(&self) -> Vec<K> {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            capacity: self.capacity,
        }
    }
}
