//! The broker core: authentication, subscriptions, bridging, heartbeats.
//!
//! Transport handlers (WebSocket, SSE) stay thin: they extract a token,
//! call [`Broker::connect`], pump frames both ways, and call
//! [`Broker::disconnect`] on the way out. Everything stateful lives here
//! and in the [`ConnectionRegistry`].
//!
//! # Bridging
//!
//! The pub/sub bus is subscribed lazily, once per channel: the first
//! connection subscribing to `site:S1:deals` creates one bus subscription
//! whose handler fans out through the registry; the last unsubscribe tears
//! it down. Site-wide notification routing (`notifications:<siteId>`) is
//! bridged on first connect of a site's connection and broadcasts to every
//! connection of that site.

use crate::auth::{extract_token, AuthConfig, AuthVerifier, Identity};
use crate::channel;
use crate::error::BrokerError;
use crate::frame::{ClientFrame, Outbound, ServerFrame};
use crate::registry::{ConnectionRegistry, Transport};
use chrono::Utc;
use proofpulse_pubsub::{HandlerId, PubSub};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};

/// WebSocket close code: server going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// WebSocket close code: policy violation (auth/limit failures).
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Broker tuning knobs.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Heartbeat period.
    pub heartbeat_interval: Duration,
    /// Per-connection writer buffer (frames) before backpressure shedding.
    pub writer_buffer: usize,
    /// Live connections allowed per identity.
    pub max_connections_per_identity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            writer_buffer: 64,
            max_connections_per_identity: 20,
        }
    }
}

/// The real-time delivery broker.
pub struct Broker<P: PubSub> {
    registry: Arc<ConnectionRegistry>,
    pubsub: P,
    verifier: AuthVerifier,
    config: BrokerConfig,
    bridges: Mutex<HashMap<String, HandlerId>>,
}

impl<P: PubSub> Broker<P> {
    /// Assemble a broker.
    #[must_use]
    pub fn new(pubsub: P, auth: &AuthConfig, config: BrokerConfig) -> Self {
        Self {
            registry: Arc::new(ConnectionRegistry::new()),
            pubsub,
            verifier: AuthVerifier::new(auth),
            config,

            bridges: Mutex::new(HashMap::new()),
        }
    }

    /// The shared connection registry (read access for handlers/tests).
    #[must_use]
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Authenticate a request from its headers and query parameters.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::MissingToken`] or
    /// [`BrokerError::InvalidToken`].
    pub fn authenticate(
        &self,
        headers: &http::HeaderMap,
        query: &HashMap<String, String>,
    ) -> Result<Identity, BrokerError> {
        let token = extract_token(headers, query)?;
        self.verifier.verify(&token)
    }

    /// Register a connection and queue its welcome frame.
    ///
    /// Returns the connection id and the receiver for the connection's
    /// single writer task.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionLimit`] when the identity is at
    /// its connection cap.
    pub async fn connect(
        &self,
        identity: Identity,
        transport: Transport,
    ) -> Result<(String, mpsc::Receiver<Outbound>), BrokerError> {
        let (tx, rx) = mpsc::channel(self.config.writer_buffer);
        let site_id = identity.site_id.clone();
        let connection_id =
            self.registry
                .register(identity, transport, tx, self.config.max_connections_per_identity)?;

        // Site-wide notification routing is bridged before the welcome so
        // no frame can slip between connect and first broadcast.
        if let Err(e) = self.ensure_site_bridge(&site_id).await {
            self.registry.remove(&connection_id);
            return Err(e);
        }

        let welcome = match transport {
            Transport::WebSocket => ServerFrame::Connection {
                connection_id: connection_id.clone(),
                message: "connected".to_string(),
            },
            Transport::Sse => ServerFrame::ConnectionEstablished {
                connection_id: connection_id.clone(),
            },
        };
        self.registry.send_to(&connection_id, welcome)?;
        self.registry.open(&connection_id);

        tracing::info!(connection_id = %connection_id, transport = ?transport, "Connection opened");
        Ok((connection_id, rx))
    }

    /// Handle one client frame, returning the reply to send.
    pub async fn handle_frame(&self, connection_id: &str, text: &str) -> ServerFrame {
        let frame: ClientFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(_) => {
                return ServerFrame::Error {
                    message: "Unknown message type".to_string(),
                }
            }
        };

        match frame {
            ClientFrame::Subscribe { channel, .. } => self.subscribe(connection_id, &channel).await,
            ClientFrame::Unsubscribe { channel } => {
                self.unsubscribe(connection_id, &channel).await
            }
            ClientFrame::Ping => {
                self.registry.mark_alive(connection_id);
                ServerFrame::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                }
            }
        }
    }

    async fn subscribe(&self, connection_id: &str, channel: &str) -> ServerFrame {
        let Some(identity) = self.registry.identity_of(connection_id) else {
            return ServerFrame::Error {
                message: "Connection not registered".to_string(),
            };
        };

        if !channel::authorized(&identity, channel) {
            tracing::warn!(
                connection_id = connection_id,
                channel = channel,
                user_id = %identity.user_id,
                "Subscription denied"
            );
            metrics::counter!("broker.subscriptions_denied").increment(1);
            return ServerFrame::Error {
                message: "Access denied to channel".to_string(),
            };
        }

        match self.registry.subscribe(connection_id, channel) {
            Ok(first) => {
                if first {
                    if let Err(e) = self.ensure_channel_bridge(channel).await {
                        tracing::error!(channel = channel, error = %e, "Bridge failed");
                    }
                }
                ServerFrame::Subscribed {
                    channel: channel.to_string(),
                }
            }
            Err(e) => ServerFrame::Error {
                message: e.to_string(),
            },
        }
    }

    async fn unsubscribe(&self, connection_id: &str, channel: &str) -> ServerFrame {
        if self.registry.unsubscribe(connection_id, channel) {
            self.drop_bridge(channel).await;
        }
        ServerFrame::Unsubscribed {
            channel: channel.to_string(),
        }
    }

    /// Tear down a connection: close frame, registry cleanup, and bridge
    /// teardown for channels that lost their last subscriber.
    pub async fn disconnect(&self, connection_id: &str, code: u16) {
        self.registry.begin_close(connection_id, code);
        let emptied = self.registry.remove(connection_id);
        for channel in emptied {
            self.drop_bridge(&channel).await;
        }
        tracing::info!(connection_id = connection_id, code = code, "Connection closed");
    }

    /// Run the heartbeat loop until shutdown.
    ///
    /// Every tick marks connections un-alive and pings them; connections
    /// that did not pong since the previous tick are disconnected.
    pub async fn run_heartbeat(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let dead = self.registry.sweep();
                    for connection_id in dead {
                        tracing::info!(
                            connection_id = %connection_id,
                            "Heartbeat missed; disconnecting"
                        );
                        metrics::counter!("broker.heartbeat_disconnects").increment(1);
                        self.disconnect(&connection_id, CLOSE_GOING_AWAY).await;
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        tracing::debug!("Heartbeat loop exiting");
    }

    /// Graceful shutdown: close every connection with 1001 and drop all
    /// bus bridges.
    pub async fn shutdown(&self) {
        for connection_id in self.registry.connection_ids() {
            self.disconnect(&connection_id, CLOSE_GOING_AWAY).await;
        }
        let mut bridges = self.bridges.lock().await;
        for (channel, handler_id) in bridges.drain() {
            let _ = self.pubsub.unsubscribe(&channel, Some(handler_id)).await;
        }
    }

    async fn ensure_site_bridge(&self, site_id: &str) -> Result<(), BrokerError> {
        let bus_channel = channel::site_notifications(site_id);
        let mut bridges = self.bridges.lock().await;
        if bridges.contains_key(&bus_channel) {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let site = site_id.to_string();
        let handler_id = self
            .pubsub
            .subscribe(
                &bus_channel,
                Arc::new(move |_, data| {
                    let frame = ServerFrame::Notification {
                        channel: None,
                        data: data.clone(),
                        timestamp: Utc::now(),
                    };
                    let stats = registry.broadcast_site(&site, &frame);
                    metrics::counter!("broker.notifications_fanned_out")
                        .increment(stats.delivered as u64);
                    Ok(())
                }),
            )
            .await
            .map_err(|e| BrokerError::PubSub(e.to_string()))?;

        bridges.insert(bus_channel, handler_id);
        Ok(())
    }

    async fn ensure_channel_bridge(&self, channel: &str) -> Result<(), BrokerError> {
        let mut bridges = self.bridges.lock().await;
        if bridges.contains_key(channel) {
            return Ok(());
        }

        let registry = Arc::clone(&self.registry);
        let handler_id = self
            .pubsub
            .subscribe(
                channel,
                Arc::new(move |channel_name, data| {
                    let frame = ServerFrame::Notification {
                        channel: Some(channel_name.to_string()),
                        data: data.clone(),
                        timestamp: Utc::now(),
                    };
                    registry.broadcast(channel_name, &frame);
                    Ok(())
                }),
            )
            .await
            .map_err(|e| BrokerError::PubSub(e.to_string()))?;

        bridges.insert(channel.to_string(), handler_id);
        Ok(())
    }

    async fn drop_bridge(&self, channel: &str) {
        let handler_id = self.bridges.lock().await.remove(channel);
        if let Some(handler_id) = handler_id {
            if let Err(e) = self.pubsub.unsubscribe(channel, Some(handler_id)).await {
                tracing::warn!(channel = channel, error = %e, "Bridge teardown failed");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use proofpulse_pubsub::LocalBus;
    use serde_json::json;

    fn auth_config() -> AuthConfig {
        AuthConfig {
            secret: "secret".to_string(),
            issuer: None,
            audience: None,
        }
    }

    fn identity(user: &str, site: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            site_id: site.to_string(),
            org_id: "org-1".to_string(),
            role: "viewer".to_string(),
        }
    }

    fn broker() -> Arc<Broker<LocalBus>> {
        Arc::new(Broker::new(
            LocalBus::new(),
            &auth_config(),
            BrokerConfig::default(),
        ))
    }

    #[tokio::test]
    async fn connect_queues_the_welcome_frame() {
        let broker = broker();
        let (id, mut rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            Outbound::Frame(ServerFrame::Connection { connection_id, .. }) => {
                assert_eq!(connection_id, id);
            }
            other => panic!("expected welcome, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sse_connections_get_connection_established() {
        let broker = broker();
        let (_id, mut rx) = broker
            .connect(identity("u-1", "S1"), Transport::Sse)
            .await
            .unwrap();

        assert!(matches!(
            rx.recv().await.unwrap(),
            Outbound::Frame(ServerFrame::ConnectionEstablished { .. })
        ));
    }

    #[tokio::test]
    async fn authorized_subscribe_confirms_and_bridges() {
        let broker = broker();
        let (id, mut rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();
        let _welcome = rx.recv().await.unwrap();

        let reply = broker
            .handle_frame(&id, r#"{"type":"subscribe","channel":"site:S1:deals"}"#)
            .await;
        assert_eq!(
            reply,
            ServerFrame::Subscribed {
                channel: "site:S1:deals".to_string()
            }
        );

        // A publish on the bus now reaches the connection.
        broker
            .pubsub
            .publish("site:S1:deals", &json!({ "deal": true }))
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            Outbound::Frame(ServerFrame::Notification { channel, data, .. }) => {
                assert_eq!(channel.as_deref(), Some("site:S1:deals"));
                assert_eq!(data["deal"], true);
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unauthorized_subscribe_is_denied_with_no_subscriber() {
        let broker = broker();
        let (id, _rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();

        let reply = broker
            .handle_frame(&id, r#"{"type":"subscribe","channel":"site:S2:notifications"}"#)
            .await;
        assert_eq!(
            reply,
            ServerFrame::Error {
                message: "Access denied to channel".to_string()
            }
        );
        assert_eq!(
            broker.registry().channel_subscribers("site:S2:notifications"),
            0
        );
    }

    #[tokio::test]
    async fn ping_gets_pong() {
        let broker = broker();
        let (id, _rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();

        let reply = broker.handle_frame(&id, r#"{"type":"ping"}"#).await;
        assert!(matches!(reply, ServerFrame::Pong { .. }));
    }

    #[tokio::test]
    async fn unknown_frame_types_get_an_error_frame() {
        let broker = broker();
        let (id, _rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();

        let reply = broker.handle_frame(&id, r#"{"type":"takeover"}"#).await;
        assert_eq!(
            reply,
            ServerFrame::Error {
                message: "Unknown message type".to_string()
            }
        );

        let reply = broker.handle_frame(&id, "not json").await;
        assert!(matches!(reply, ServerFrame::Error { .. }));
    }

    #[tokio::test]
    async fn unsubscribe_tears_down_the_bridge() {
        let broker = broker();
        let (id, _rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();

        broker
            .handle_frame(&id, r#"{"type":"subscribe","channel":"public:deals"}"#)
            .await;
        assert_eq!(
            broker.pubsub.publish("public:deals", &json!({})).await.unwrap(),
            1
        );

        let reply = broker
            .handle_frame(&id, r#"{"type":"unsubscribe","channel":"public:deals"}"#)
            .await;
        assert_eq!(
            reply,
            ServerFrame::Unsubscribed {
                channel: "public:deals".to_string()
            }
        );
        assert_eq!(
            broker.pubsub.publish("public:deals", &json!({})).await.unwrap(),
            0,
            "bus subscription dropped with the last subscriber"
        );

        // Repeating the unsubscribe is harmless.
        let reply = broker
            .handle_frame(&id, r#"{"type":"unsubscribe","channel":"public:deals"}"#)
            .await;
        assert!(matches!(reply, ServerFrame::Unsubscribed { .. }));
    }

    #[tokio::test]
    async fn site_notifications_reach_all_site_connections() {
        let broker = broker();
        let (_a, mut rx_a) = broker
            .connect(identity("u-1", "S1"), Transport::Sse)
            .await
            .unwrap();
        let (_b, mut rx_b) = broker
            .connect(identity("u-2", "S1"), Transport::WebSocket)
            .await
            .unwrap();
        let _ = rx_a.recv().await;
        let _ = rx_b.recv().await;

        broker
            .pubsub
            .publish("notifications:S1", &json!({ "customerName": "Ana" }))
            .await
            .unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.unwrap() {
                Outbound::Frame(ServerFrame::Notification { data, .. }) => {
                    assert_eq!(data["customerName"], "Ana");
                }
                other => panic!("expected notification, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_cleans_registry_and_bridges() {
        let broker = broker();
        let (id, _rx) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();
        broker
            .handle_frame(&id, r#"{"type":"subscribe","channel":"public:deals"}"#)
            .await;

        broker.disconnect(&id, CLOSE_GOING_AWAY).await;
        assert_eq!(broker.registry().connection_count(), 0);
        assert_eq!(
            broker.pubsub.publish("public:deals", &json!({})).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn shutdown_closes_every_connection() {
        let broker = broker();
        let (_a, mut rx_a) = broker
            .connect(identity("u-1", "S1"), Transport::WebSocket)
            .await
            .unwrap();
        let _ = rx_a.recv().await; // welcome

        broker.shutdown().await;
        assert_eq!(broker.registry().connection_count(), 0);

        // The close command reached the writer.
        let mut saw_close = false;
        while let Ok(outbound) = rx_a.try_recv() {
            if outbound == Outbound::Close(CLOSE_GOING_AWAY) {
                saw_close = true;
            }
        }
        assert!(saw_close);
    }
}
