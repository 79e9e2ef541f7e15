//! Channelized pub/sub fan-out for ProofPulse.
//!
//! Delivery workers publish rendered notifications onto tenant channels
//! (`notifications:<siteId>`); the real-time broker subscribes and fans
//! them out to connected browsers. Two implementations share one contract:
//!
//! - [`LocalBus`] - in-process, synchronous dispatch; single-node mode and
//!   tests.
//! - [`RedisBus`] - Redis pub/sub for cross-node fan-out, with a single
//!   backend subscription per channel and capped reconnect backoff.
//!
//! # Laws
//!
//! - Multiple handlers per channel are allowed; the backend subscribes once
//!   and the local registry multiplexes.
//! - A failing handler never affects its siblings for the same message.
//! - Within a channel, each subscriber sees one publisher's messages in
//!   publish order.
//! - Unsubscribing a channel you never subscribed to is a no-op.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod registry;

pub mod local;
pub mod redis;

pub use local::LocalBus;
pub use redis::RedisBus;
pub use registry::HandlerId;

use std::sync::Arc;
use thiserror::Error;

/// A message handler: receives the channel name and the decoded JSON body.
///
/// Handlers run on the dispatch path and must be quick; hand slow work to a
/// task via a channel. A returned error is logged and isolated.
pub type Handler =
    Arc<dyn Fn(&str, &serde_json::Value) -> Result<(), String> + Send + Sync>;

/// Errors raised by pub/sub operations.
#[derive(Error, Debug)]
pub enum PubSubError {
    /// The backend failed.
    #[error("Pub/sub backend error: {0}")]
    Backend(String),

    /// A message could not be serialized for publishing.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// The pub/sub contract shared by all implementations.
pub trait PubSub: Send + Sync {
    /// Publish a message to a channel. Returns the number of receivers.
    fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> impl std::future::Future<Output = Result<usize, PubSubError>> + Send;

    /// Register a handler for a channel.
    fn subscribe(
        &self,
        channel: &str,
        handler: Handler,
    ) -> impl std::future::Future<Output = Result<HandlerId, PubSubError>> + Send;

    /// Remove one handler (`Some(id)`) or all handlers (`None`) for a
    /// channel, dropping the backend subscription when none remain.
    fn unsubscribe(
        &self,
        channel: &str,
        handler: Option<HandlerId>,
    ) -> impl std::future::Future<Output = Result<(), PubSubError>> + Send;
}
