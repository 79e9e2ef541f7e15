//! In-process pub/sub bus.
//!
//! Dispatch happens synchronously on the publisher's task, in publish
//! order, which makes this the reference implementation for the pub/sub
//! laws and the default for single-node deployments and tests.

use crate::registry::{HandlerId, HandlerRegistry};
use crate::{Handler, PubSub, PubSubError};
use std::sync::Arc;

/// Process-local pub/sub with no external backend.
#[derive(Clone, Default)]
pub struct LocalBus {
    registry: Arc<HandlerRegistry>,
}

impl LocalBus {
    /// Create an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl PubSub for LocalBus {
    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<usize, PubSubError> {
        let delivered = self.registry.dispatch(channel, message);
        metrics::counter!("pubsub.published", "backend" => "local").increment(1);
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<HandlerId, PubSubError> {
        let (id, _first) = self.registry.add(channel, handler);
        Ok(id)
    }

    async fn unsubscribe(
        &self,
        channel: &str,
        handler: Option<HandlerId>,
    ) -> Result<(), PubSubError> {
        self.registry.remove(channel, handler);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    fn recording(into: Arc<Mutex<Vec<serde_json::Value>>>) -> Handler {
        Arc::new(move |_, message| {
            into.lock().unwrap().push(message.clone());
            Ok(())
        })
    }

    #[tokio::test]
    async fn publish_counts_receivers() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("ch", recording(seen.clone())).await.unwrap();
        bus.subscribe("ch", recording(seen.clone())).await.unwrap();

        let receivers = bus.publish("ch", &json!({"n": 1})).await.unwrap();
        assert_eq!(receivers, 2);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn publish_without_subscribers_reaches_nobody() {
        let bus = LocalBus::new();
        assert_eq!(bus.publish("empty", &json!({})).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn messages_arrive_in_publish_order() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("ch", recording(seen.clone())).await.unwrap();

        for n in 0..5 {
            bus.publish("ch", &json!({ "n": n })).await.unwrap();
        }

        let seen = seen.lock().unwrap();
        let order: Vec<_> = seen.iter().map(|v| v["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn unsubscribe_by_id_leaves_siblings() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let id = bus.subscribe("ch", recording(seen.clone())).await.unwrap();
        bus.subscribe("ch", recording(seen.clone())).await.unwrap();

        bus.unsubscribe("ch", Some(id)).await.unwrap();
        assert_eq!(bus.publish("ch", &json!({})).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_all_then_again_is_a_no_op() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("ch", recording(seen.clone())).await.unwrap();

        bus.unsubscribe("ch", None).await.unwrap();
        assert_eq!(bus.publish("ch", &json!({})).await.unwrap(), 0);
        // Repeating it must not fail.
        bus.unsubscribe("ch", None).await.unwrap();
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let bus = LocalBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("a", recording(seen.clone())).await.unwrap();

        bus.publish("b", &json!({})).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }
}
