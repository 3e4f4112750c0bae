//! Bounded LRU+TTL caches
//!
//! The dedup, quote, and outbound-self caches all share the same shape:
//! timestamped entries with lazy eviction on every write once the size
//! cap is exceeded.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Bounded cache with per-entry TTL and oldest-first eviction at capacity
#[derive(Debug)]
pub struct TtlCache<K, V> {
    entries: HashMap<K, (V, Instant)>,
    ttl: Duration,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V> TtlCache<K, V> {
    /// Create a cache with the given TTL and size cap
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Insert a value, evicting expired entries first and then the
    /// oldest entry if still at capacity
    pub fn insert(&mut self, key: K, value: V) {
        let now = Instant::now();

        if self.entries.len() >= self.max_entries {
            let ttl = self.ttl;
            self.entries
                .retain(|_, (_, ts)| now.duration_since(*ts) < ttl);
        }

        if self.entries.len() >= self.max_entries {
            if let Some(oldest) = self
                .entries
                .iter()
                .min_by_key(|(_, (_, ts))| *ts)
                .map(|(k, _)| k.clone())
            {
                self.entries.remove(&oldest);
            }
        }

        self.entries.insert(key, (value, now));
    }

    /// Fetch a live (non-expired) value
    pub fn get(&self, key: &K) -> Option<&V> {
        let (value, ts) = self.entries.get(key)?;
        if ts.elapsed() < self.ttl {
            Some(value)
        } else {
            None
        }
    }

    /// Whether a live entry exists for the key
    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Remove an entry
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|(v, _)| v)
    }

    /// Number of stored entries (including not-yet-evicted expired ones)
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Dedup variant: only key presence matters.
///
/// `check_and_insert` returns `true` when the key was already seen
/// within the TTL window.
#[derive(Debug)]
pub struct DedupCache<K> {
    inner: TtlCache<K, ()>,
}

impl<K: Eq + Hash + Clone> DedupCache<K> {
    /// Create a dedup cache with the given TTL and size cap
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            inner: TtlCache::new(ttl, max_entries),
        }
    }

    /// Record the key; returns `true` if it was a duplicate
    pub fn check_and_insert(&mut self, key: K) -> bool {
        if self.inner.contains(&key) {
            return true;
        }
        self.inner.insert(key, ());
        false
    }

    /// Number of stored entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}
