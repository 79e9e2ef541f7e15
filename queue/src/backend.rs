//! Queue backend abstraction.
//!
//! The queue logic needs exactly one storage primitive: a scored multiset
//! per key with atomic member removal. Redis sorted sets provide it in
//! production; [`InMemoryBackend`] provides it for tests and single-node
//! development without a Redis round-trip.

use crate::error::QueueError;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// A scored multiset store keyed by string.
///
/// Members are opaque strings; scores are f64 with ascending order meaning
/// "first out". `remove` must be atomic per member: when two takers race,
/// exactly one sees `true`.
pub trait QueueBackend: Send + Sync {
    /// Insert (or upsert) a member with a score, refreshing the key TTL.
    fn insert(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Read up to `limit` members with `score <= max_score`, ascending.
    fn fetch_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<String>, QueueError>> + Send;

    /// Read up to `limit` members with scores, ascending, no score bound.
    fn fetch_range(
        &self,
        key: &str,
        limit: usize,
    ) -> impl std::future::Future<Output = Result<Vec<(String, f64)>, QueueError>> + Send;

    /// Atomically remove a member. Returns whether this call removed it.
    fn remove(
        &self,
        key: &str,
        member: &str,
    ) -> impl std::future::Future<Output = Result<bool, QueueError>> + Send;

    /// Delete the whole key.
    fn clear(&self, key: &str)
        -> impl std::future::Future<Output = Result<(), QueueError>> + Send;

    /// Count all members.
    fn len(&self, key: &str)
        -> impl std::future::Future<Output = Result<u64, QueueError>> + Send;

    /// Count members with `score <= max_score`.
    fn count_below(
        &self,
        key: &str,
        max_score: f64,
    ) -> impl std::future::Future<Output = Result<u64, QueueError>> + Send;
}

/// Process-local backend over `HashMap` + sorted vectors.
///
/// TTLs are accepted and ignored; the process lifetime bounds the data.
#[derive(Default)]
pub struct InMemoryBackend {
    sets: Mutex<HashMap<String, Vec<(String, f64)>>>,
}

impl InMemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_sets<T>(&self, f: impl FnOnce(&mut HashMap<String, Vec<(String, f64)>>) -> T) -> T {
        let mut guard = self.sets.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }
}

impl QueueBackend for InMemoryBackend {
    async fn insert(
        &self,
        key: &str,
        member: &str,
        score: f64,
        _ttl: Duration,
    ) -> Result<(), QueueError> {
        self.with_sets(|sets| {
            let set = sets.entry(key.to_string()).or_default();
            if let Some(existing) = set.iter_mut().find(|(m, _)| m == member) {
                existing.1 = score;
            } else {
                set.push((member.to_string(), score));
            }
            set.sort_by(|a, b| a.1.total_cmp(&b.1));
        });
        Ok(())
    }

    async fn fetch_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        Ok(self.with_sets(|sets| {
            sets.get(key)
                .map(|set| {
                    set.iter()
                        .filter(|(_, score)| *score <= max_score)
                        .take(limit)
                        .map(|(member, _)| member.clone())
                        .collect()
                })
                .unwrap_or_default()
        }))
    }

    async fn fetch_range(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, QueueError> {
        Ok(self.with_sets(|sets| {
            sets.get(key)
                .map(|set| set.iter().take(limit).cloned().collect())
                .unwrap_or_default()
        }))
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool, QueueError> {
        Ok(self.with_sets(|sets| {
            sets.get_mut(key).is_some_and(|set| {
                let before = set.len();
                set.retain(|(m, _)| m != member);
                set.len() < before
            })
        }))
    }

    async fn clear(&self, key: &str) -> Result<(), QueueError> {
        self.with_sets(|sets| {
            sets.remove(key);
        });
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<u64, QueueError> {
        Ok(self.with_sets(|sets| sets.get(key).map(|set| set.len() as u64).unwrap_or(0)))
    }

    async fn count_below(&self, key: &str, max_score: f64) -> Result<u64, QueueError> {
        Ok(self.with_sets(|sets| {
            sets.get(key)
                .map(|set| set.iter().filter(|(_, score)| *score <= max_score).count() as u64)
                .unwrap_or(0)
        }))
    }
}
