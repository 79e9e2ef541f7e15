//! Redis pub/sub bus for cross-node fan-out.
//!
//! One listener task owns the subscription connection. The backend is
//! subscribed to each channel exactly once, no matter how many local
//! handlers are registered; the shared registry multiplexes deliveries.
//! When the channel set changes or the connection drops, the listener
//! rebuilds its subscriptions, backing off exponentially up to two seconds
//! on transport errors.

use crate::registry::{HandlerId, HandlerRegistry};
use crate::{Handler, PubSub, PubSubError};
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Redis-backed pub/sub with local handler multiplexing.
#[derive(Clone)]
pub struct RedisBus {
    conn_manager: ConnectionManager,
    registry: Arc<HandlerRegistry>,
    resync: Arc<Notify>,
    shutdown: watch::Sender<bool>,
}

impl RedisBus {
    /// Connect to Redis and start the listener task.
    ///
    /// # Errors
    ///
    /// Returns [`PubSubError::Backend`] when the URL is invalid or the
    /// publish connection cannot be established.
    pub async fn connect(redis_url: &str) -> Result<Self, PubSubError> {
        let client = Client::open(redis_url)
            .map_err(|e| PubSubError::Backend(format!("Failed to create Redis client: {e}")))?;
        let conn_manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            PubSubError::Backend(format!("Failed to create Redis connection manager: {e}"))
        })?;

        let registry = Arc::new(HandlerRegistry::default());
        let resync = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(listen(
            client,
            Arc::clone(&registry),
            Arc::clone(&resync),
            shutdown_rx,
        ));

        Ok(Self {
            conn_manager,
            registry,
            resync,
            shutdown: shutdown_tx,
        })
    }

    /// Stop the listener task. Registered handlers stop receiving.
    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl PubSub for RedisBus {
    async fn publish(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<usize, PubSubError> {
        let payload = serde_json::to_string(message)
            .map_err(|e| PubSubError::Serialization(e.to_string()))?;
        let mut conn = self.conn_manager.clone();
        let receivers: i64 = conn
            .publish(channel, payload)
            .await
            .map_err(|e| PubSubError::Backend(format!("PUBLISH {channel} failed: {e}")))?;
        metrics::counter!("pubsub.published", "backend" => "redis").increment(1);
        Ok(usize::try_from(receivers).unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str, handler: Handler) -> Result<HandlerId, PubSubError> {
        let (id, first) = self.registry.add(channel, handler);
        if first {
            // First local handler for this channel: the listener must
            // subscribe at the backend.
            self.resync.notify_one();
        }
        Ok(id)
    }

    async fn unsubscribe(
        &self,
        channel: &str,
        handler: Option<HandlerId>,
    ) -> Result<(), PubSubError> {
        if self.registry.remove(channel, handler) {
            self.resync.notify_one();
        }
        Ok(())
    }
}

/// Listener loop: owns the subscription connection and rebuilds it on
/// membership changes and transport failures.
async fn listen(
    client: Client,
    registry: Arc<HandlerRegistry>,
    resync: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown.borrow() {
            break;
        }

        let channels = registry.channels();
        if channels.is_empty() {
            tokio::select! {
                _ = resync.notified() => continue,
                _ = shutdown.changed() => break,
            }
        }

        let mut pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => pubsub,
            Err(e) => {
                tracing::warn!(error = %e, backoff = ?backoff, "Pub/sub connection failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
        };

        let mut subscribed = true;
        for channel in &channels {
            if let Err(e) = pubsub.subscribe(channel).await {
                tracing::warn!(channel = %channel, error = %e, "Backend subscribe failed");
                subscribed = false;
                break;
            }
        }
        if !subscribed {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
            continue;
        }

        tracing::debug!(channels = ?channels, "Pub/sub listener subscribed");
        backoff = INITIAL_BACKOFF;

        let mut lost = false;
        {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    message = stream.next() => {
                        let Some(message) = message else {
                            lost = true;
                            break;
                        };
                        let channel = message.get_channel_name().to_string();
                        match message.get_payload::<String>() {
                            Ok(payload) => match serde_json::from_str(&payload) {
                                Ok(value) => {
                                    registry.dispatch(&channel, &value);
                                }
                                Err(e) => {
                                    tracing::warn!(channel = %channel, error = %e, "Dropping non-JSON pub/sub payload");
                                }
                            },
                            Err(e) => {
                                tracing::warn!(channel = %channel, error = %e, "Failed to read pub/sub payload");
                            }
                        }
                    }
                    _ = resync.notified() => break,
                    _ = shutdown.changed() => return,
                }
            }
        }

        if lost {
            tracing::warn!(backoff = ?backoff, "Pub/sub connection lost, reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    tracing::debug!("Pub/sub listener exiting");
}
