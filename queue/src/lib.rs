//! Priority queues, retry/dead-letter handling, and frequency caps.
//!
//! Notifications leave the materializer as [`QueueItem`]s on per-channel
//! queues and wait for a delivery worker to claim them:
//!
//! ```text
//! Materializer ──enqueue──> queue:<channel>   (scored multiset)
//!                               │
//!                        worker dequeue (due + atomic claim)
//!                          ok │        │ failure
//!                      delivered    requeue(+delay)
//!                                       │ budget exhausted / expired / poison
//!                                queue:dlq:<channel>  (7-day retention)
//! ```
//!
//! Scoring folds priority and scheduled time into a single sortable number
//! (see [`item::score_for`]); Redis sorted sets execute the whole contract
//! with plain `ZADD`/`ZRANGEBYSCORE`/`ZREM`, and an in-memory backend
//! mirrors it for tests.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backend;
pub mod error;
pub mod frequency;
pub mod item;
pub mod queue;
pub mod redis;

pub use backend::{InMemoryBackend, QueueBackend};
pub use error::QueueError;
pub use frequency::FrequencyLimiter;
pub use item::{score_for, DeadLetter, DlqReason, Priority, QueueItem, QueueStats};
pub use queue::PriorityQueue;
pub use redis::RedisBackend;
