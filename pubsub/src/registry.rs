//! Local handler registry shared by the pub/sub implementations.
//!
//! The backend subscribes once per channel; this registry multiplexes each
//! delivered message out to every locally registered handler, isolating
//! handler failures from each other.

use crate::Handler;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

/// Identifies one registered handler for targeted unsubscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub(crate) u64);

#[derive(Default)]
pub(crate) struct HandlerRegistry {
    channels: RwLock<HashMap<String, Vec<(HandlerId, Handler)>>>,
    next_id: AtomicU64,
}

impl HandlerRegistry {
    /// Register a handler. Returns the id and whether this is the first
    /// handler for the channel (the backend should subscribe).
    pub(crate) fn add(&self, channel: &str, handler: Handler) -> (HandlerId, bool) {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let handlers = channels.entry(channel.to_string()).or_default();
        let first = handlers.is_empty();
        handlers.push((id, handler));
        (id, first)
    }

    /// Remove one handler (`Some(id)`) or all handlers (`None`). Returns
    /// whether the channel has no handlers left (the backend should
    /// unsubscribe).
    pub(crate) fn remove(&self, channel: &str, id: Option<HandlerId>) -> bool {
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = channels.get_mut(channel) else {
            return true;
        };
        match id {
            Some(id) => handlers.retain(|(handler_id, _)| *handler_id != id),
            None => handlers.clear(),
        }
        if handlers.is_empty() {
            channels.remove(channel);
            true
        } else {
            false
        }
    }

    /// Invoke every handler for a channel. A failing handler is logged and
    /// does not affect its siblings. Returns how many handlers ran.
    pub(crate) fn dispatch(&self, channel: &str, message: &serde_json::Value) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        let Some(handlers) = channels.get(channel) else {
            return 0;
        };
        for (id, handler) in handlers {
            if let Err(e) = handler(channel, message) {
                tracing::warn!(
                    channel = %channel,
                    handler = id.0,
                    error = %e,
                    "Pub/sub handler failed; siblings unaffected"
                );
                metrics::counter!("pubsub.handler_errors").increment(1);
            }
        }
        handlers.len()
    }

    /// Channels with at least one handler.
    pub(crate) fn channels(&self) -> Vec<String> {
        self.channels
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn counting_handler(counter: Arc<AtomicUsize>) -> Handler {
        Arc::new(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn first_and_last_handler_toggle_backend_subscription() {
        let registry = HandlerRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));

        let (a, first) = registry.add("ch", counting_handler(counter.clone()));
        assert!(first);
        let (_b, first) = registry.add("ch", counting_handler(counter));
        assert!(!first);

        assert!(!registry.remove("ch", Some(a)));
        assert!(registry.remove("ch", None));
    }

    #[test]
    fn dispatch_isolates_failing_handlers() {
        let registry = HandlerRegistry::default();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.add("ch", Arc::new(|_, _| Err("boom".to_string())));
        registry.add("ch", counting_handler(counter.clone()));

        let delivered = registry.dispatch("ch", &serde_json::json!({"x": 1}));
        assert_eq!(delivered, 2);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn repeated_remove_is_a_no_op() {
        let registry = HandlerRegistry::default();
        assert!(registry.remove("ghost", None));
        assert!(registry.remove("ghost", Some(HandlerId(42))));
    }
}
