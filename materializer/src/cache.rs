//! In-process caches for compiled templates and rendered output.
//!
//! Two shapes, both behind their own lock:
//!
//! - [`AccessCountCache`] - bounded, evicts the least-accessed entry on
//!   insert. Compiled templates are hot-or-cold; access counts beat pure
//!   recency for them.
//! - [`TtlCache`] - bounded and time-limited; rendered output must not
//!   outlive template or context changes by more than the TTL.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

struct Counted<V> {
    value: V,
    access_count: u64,
}

/// Bounded cache evicting the least-accessed entry when full.
pub struct AccessCountCache<K, V> {
    entries: Mutex<HashMap<K, Counted<V>>>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> AccessCountCache<K, V> {
    /// Create a cache holding at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
        }
    }

    /// Fetch a value, bumping its access count.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get_mut(key).map(|entry| {
            entry.access_count += 1;
            entry.value.clone()
        })
    }

    /// Insert a value, evicting the least-accessed entry when over
    /// capacity.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let coldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.access_count)
                .map(|(k, _)| k.clone());
            if let Some(coldest) = coldest {
                entries.remove(&coldest);
            }
        }
        entries.insert(
            key,
            Counted {
                value,
                access_count: 0,
            },
        );
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Timed<V> {
    value: V,
    inserted_at: Instant,
    access_count: u64,
}

/// Bounded cache with per-entry TTL and least-accessed eviction.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, Timed<V>>>,
    capacity: usize,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// Create a cache with a capacity and TTL.
    #[must_use]
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            ttl,
        }
    }

    /// Fetch a live value; expired entries are dropped lazily.
    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get_mut(key) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => {
                entry.access_count += 1;
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a value with a fresh TTL.
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // Drop anything already expired before considering eviction.
        let ttl = self.ttl;
        entries.retain(|_, entry| entry.inserted_at.elapsed() <= ttl);

        if entries.len() >= self.capacity && !entries.contains_key(&key) {
            let coldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.access_count)
                .map(|(k, _)| k.clone());
            if let Some(coldest) = coldest {
                entries.remove(&coldest);
            }
        }
        entries.insert(
            key,
            Timed {
                value,
                inserted_at: Instant::now(),
                access_count: 0,
            },
        );
    }

    /// Number of cached entries, counting not-yet-reaped expired ones.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
