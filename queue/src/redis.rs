//! Redis implementation of the queue backend.
//!
//! Sorted sets give the scored multiset directly: `ZADD` for insert,
//! `ZRANGEBYSCORE` for bounded reads, and `ZREM` - which reports whether
//! this caller removed the member - for the atomic take that keeps two
//! workers from delivering the same item twice.

use crate::backend::QueueBackend;
use crate::error::QueueError;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::time::Duration;

/// Redis-backed scored multiset store.
///
/// Uses a [`ConnectionManager`] for pooling and reconnects, matching how
/// the rest of the pipeline talks to Redis.
#[derive(Clone)]
pub struct RedisBackend {
    conn_manager: ConnectionManager,
}

impl RedisBackend {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::Backend`] when the URL is invalid or the
    /// connection cannot be established.
    pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
        let client = Client::open(redis_url)
            .map_err(|e| QueueError::Backend(format!("Failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client).await.map_err(|e| {
            QueueError::Backend(format!("Failed to create Redis connection manager: {e}"))
        })?;
        Ok(Self { conn_manager })
    }
}

#[allow(clippy::cast_possible_wrap)] // TTLs and counts stay far below i64::MAX.
impl QueueBackend for RedisBackend {
    async fn insert(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();
        // ZADD + EXPIRE in one atomic pipeline so the key never outlives
        // its TTL refresh.
        let _: () = redis::pipe()
            .atomic()
            .zadd(key, member, score)
            .expire(key, ttl.as_secs() as i64)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(format!("ZADD {key} failed: {e}")))?;
        Ok(())
    }

    async fn fetch_below(
        &self,
        key: &str,
        max_score: f64,
        limit: usize,
    ) -> Result<Vec<String>, QueueError> {
        let mut conn = self.conn_manager.clone();
        conn.zrangebyscore_limit(key, "-inf", max_score, 0, limit as isize)
            .await
            .map_err(|e| QueueError::Backend(format!("ZRANGEBYSCORE {key} failed: {e}")))
    }

    async fn fetch_range(
        &self,
        key: &str,
        limit: usize,
    ) -> Result<Vec<(String, f64)>, QueueError> {
        let mut conn = self.conn_manager.clone();
        conn.zrangebyscore_limit_withscores(key, "-inf", "+inf", 0, limit as isize)
            .await
            .map_err(|e| QueueError::Backend(format!("ZRANGEBYSCORE {key} failed: {e}")))
    }

    async fn remove(&self, key: &str, member: &str) -> Result<bool, QueueError> {
        let mut conn = self.conn_manager.clone();
        let removed: i64 = conn
            .zrem(key, member)
            .await
            .map_err(|e| QueueError::Backend(format!("ZREM {key} failed: {e}")))?;
        Ok(removed > 0)
    }

    async fn clear(&self, key: &str) -> Result<(), QueueError> {
        let mut conn = self.conn_manager.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| QueueError::Backend(format!("DEL {key} failed: {e}")))?;
        Ok(())
    }

    async fn len(&self, key: &str) -> Result<u64, QueueError> {
        let mut conn = self.conn_manager.clone();
        conn.zcard(key)
            .await
            .map_err(|e| QueueError::Backend(format!("ZCARD {key} failed: {e}")))
    }

    async fn count_below(&self, key: &str, max_score: f64) -> Result<u64, QueueError> {
        let mut conn = self.conn_manager.clone();
        conn.zcount(key, "-inf", max_score)
            .await
            .map_err(|e| QueueError::Backend(format!("ZCOUNT {key} failed: {e}")))
    }
}
