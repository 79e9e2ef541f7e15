//! Connection registry: the broker's single source of truth.
//!
//! One `RwLock` guards the connection map and the channel/site indexes
//! (reads take the shared lock, mutations the exclusive one). Each
//! connection's frames go through a bounded mpsc sender whose receiving
//! end is owned by that connection's single writer task - frames are never
//! interleaved, and a full buffer sheds `notification` frames for that
//! connection only.

use crate::auth::Identity;
use crate::error::BrokerError;
use crate::frame::{Outbound, ServerFrame};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use tokio::sync::mpsc;
use uuid::Uuid;

/// How a connection reached us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Bidirectional WebSocket; heartbeats use protocol pings.
    WebSocket,
    /// Server-sent events; liveness is detected by write failures.
    Sse,
}

/// Connection lifecycle, strictly one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    /// Accepted, welcome not yet sent.
    Connecting,
    /// Live; the only state where subscribe/broadcast apply.
    Open,
    /// Close initiated.
    Closing,
    /// Gone.
    Closed,
}

struct Connection {
    identity: Identity,
    transport: Transport,
    state: ConnectionState,
    subscriptions: HashSet<String>,
    #[allow(dead_code)] // Read by ops tooling via stats; kept for parity with the wire model.
    connected_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    alive: bool,
    sender: mpsc::Sender<Outbound>,
}

/// Fan-out accounting for one broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    /// Frames handed to writer tasks.
    pub delivered: usize,
    /// Frames shed because a writer buffer was full.
    pub dropped: usize,
    /// Connections whose writer was already gone.
    pub failed: usize,
}

#[derive(Default)]
struct Inner {
    connections: HashMap<String, Connection>,
    channels: HashMap<String, HashSet<String>>,
    sites: HashMap<String, HashSet<String>>,
    per_identity: HashMap<String, usize>,
}

/// The broker's connection and subscription state.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(&self, f: impl FnOnce(&Inner) -> T) -> T {
        f(&self.inner.read().unwrap_or_else(PoisonError::into_inner))
    }

    fn write<T>(&self, f: impl FnOnce(&mut Inner) -> T) -> T {
        f(&mut self.inner.write().unwrap_or_else(PoisonError::into_inner))
    }

    /// Register a connection in `Connecting` state.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionLimit`] when the identity already
    /// holds `max_per_identity` live connections.
    pub fn register(
        &self,
        identity: Identity,
        transport: Transport,
        sender: mpsc::Sender<Outbound>,
        max_per_identity: usize,
    ) -> Result<String, BrokerError> {
        self.write(|inner| {
            let live = inner
                .per_identity
                .get(&identity.user_id)
                .copied()
                .unwrap_or(0);
            if live >= max_per_identity {
                return Err(BrokerError::ConnectionLimit);
            }

            let id = Uuid::new_v4().to_string();
            let now = Utc::now();
            inner
                .per_identity
                .entry(identity.user_id.clone())
                .and_modify(|count| *count += 1)
                .or_insert(1);
            inner
                .sites
                .entry(identity.site_id.clone())
                .or_default()
                .insert(id.clone());
            inner.connections.insert(
                id.clone(),
                Connection {
                    identity,
                    transport,
                    state: ConnectionState::Connecting,
                    subscriptions: HashSet::new(),
                    connected_at: now,
                    last_activity_at: now,
                    alive: true,
                    sender,
                },
            );
            metrics::gauge!("broker.connections").increment(1.0);
            Ok(id)
        })
    }

    /// Advance a connection to `Open` (idempotent; never goes backwards).
    pub fn open(&self, connection_id: &str) {
        self.write(|inner| {
            if let Some(connection) = inner.connections.get_mut(connection_id) {
                if connection.state < ConnectionState::Open {
                    connection.state = ConnectionState::Open;
                }
            }
        });
    }

    /// The identity behind a connection.
    #[must_use]
    pub fn identity_of(&self, connection_id: &str) -> Option<Identity> {
        self.read(|inner| {
            inner
                .connections
                .get(connection_id)
                .map(|connection| connection.identity.clone())
        })
    }

    /// Add a subscription. Returns whether this connection is the
    /// channel's first subscriber (the caller should bridge the channel).
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionNotFound`] for unknown ids and
    /// [`BrokerError::NotOpen`] outside the `Open` state.
    pub fn subscribe(&self, connection_id: &str, channel: &str) -> Result<bool, BrokerError> {
        self.write(|inner| {
            let connection = inner
                .connections
                .get_mut(connection_id)
                .ok_or_else(|| BrokerError::ConnectionNotFound(connection_id.to_string()))?;
            if connection.state != ConnectionState::Open {
                return Err(BrokerError::NotOpen);
            }
            connection.subscriptions.insert(channel.to_string());
            connection.last_activity_at = Utc::now();

            let subscribers = inner.channels.entry(channel.to_string()).or_default();
            let first = subscribers.is_empty();
            subscribers.insert(connection_id.to_string());
            Ok(first)
        })
    }

    /// Drop a subscription. Returns whether the channel is now empty.
    /// Unsubscribing a channel the connection never joined is a no-op.
    pub fn unsubscribe(&self, connection_id: &str, channel: &str) -> bool {
        self.write(|inner| {
            if let Some(connection) = inner.connections.get_mut(connection_id) {
                connection.subscriptions.remove(channel);
                connection.last_activity_at = Utc::now();
            }
            match inner.channels.get_mut(channel) {
                Some(subscribers) => {
                    subscribers.remove(connection_id);
                    if subscribers.is_empty() {
                        inner.channels.remove(channel);
                        true
                    } else {
                        false
                    }
                }
                None => true,
            }
        })
    }

    /// Whether a connection currently subscribes to a channel.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &str, channel: &str) -> bool {
        self.read(|inner| {
            inner
                .channels
                .get(channel)
                .is_some_and(|subscribers| subscribers.contains(connection_id))
        })
    }

    /// Subscriber count for a channel.
    #[must_use]
    pub fn channel_subscribers(&self, channel: &str) -> usize {
        self.read(|inner| inner.channels.get(channel).map_or(0, HashSet::len))
    }

    /// Live connection count.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.read(|inner| inner.connections.len())
    }

    /// Mark a connection alive (pong received) and touch its activity.
    pub fn mark_alive(&self, connection_id: &str) {
        self.write(|inner| {
            if let Some(connection) = inner.connections.get_mut(connection_id) {
                connection.alive = true;
                connection.last_activity_at = Utc::now();
            }
        });
    }

    /// Send one frame to one connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConnectionNotFound`] when the connection is
    /// unknown; a full or closed writer is logged, not an error.
    pub fn send_to(&self, connection_id: &str, frame: ServerFrame) -> Result<(), BrokerError> {
        self.read(|inner| {
            let connection = inner
                .connections
                .get(connection_id)
                .ok_or_else(|| BrokerError::ConnectionNotFound(connection_id.to_string()))?;
            if connection.sender.try_send(Outbound::Frame(frame)).is_err() {
                tracing::warn!(connection_id = connection_id, "Writer busy; frame dropped");
                metrics::counter!("broker.frames_dropped").increment(1);
            }
            Ok(())
        })
    }

    /// Broadcast a frame to a channel's open subscribers.
    ///
    /// Slow or dead connections never block siblings: full buffers shed
    /// the frame, closed writers are counted as failures.
    pub fn broadcast(&self, channel: &str, frame: &ServerFrame) -> BroadcastStats {
        self.read(|inner| {
            let Some(subscribers) = inner.channels.get(channel) else {
                return BroadcastStats::default();
            };
            Self::fan_out(inner, subscribers, frame)
        })
    }

    /// Broadcast to every open connection of a site (the background
    /// `notifications:<siteId>` route).
    pub fn broadcast_site(&self, site_id: &str, frame: &ServerFrame) -> BroadcastStats {
        self.read(|inner| {
            let Some(members) = inner.sites.get(site_id) else {
                return BroadcastStats::default();
            };
            Self::fan_out(inner, members, frame)
        })
    }

    fn fan_out(inner: &Inner, targets: &HashSet<String>, frame: &ServerFrame) -> BroadcastStats {
        let mut stats = BroadcastStats::default();
        for connection_id in targets {
            let Some(connection) = inner.connections.get(connection_id) else {
                stats.failed += 1;
                continue;
            };
            if connection.state != ConnectionState::Open {
                continue;
            }
            match connection.sender.try_send(Outbound::Frame(frame.clone())) {
                Ok(()) => stats.delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    stats.dropped += 1;
                    metrics::counter!("broker.frames_dropped").increment(1);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => stats.failed += 1,
            }
        }
        stats
    }

    /// Heartbeat sweep: returns the ids of WebSocket connections that
    /// missed their pong (to disconnect), and pings the rest.
    ///
    /// With no connections this is a no-op.
    pub fn sweep(&self) -> Vec<String> {
        self.write(|inner| {
            let mut dead = Vec::new();
            for (id, connection) in &mut inner.connections {
                if connection.transport != Transport::WebSocket
                    || connection.state != ConnectionState::Open
                {
                    continue;
                }
                if connection.alive {
                    // Mark before ping; the pong flips it back.
                    connection.alive = false;
                    let _ = connection.sender.try_send(Outbound::Ping);
                } else {
                    dead.push(id.clone());
                }
            }
            dead
        })
    }

    /// Begin closing: advance the state and queue a close frame.
    pub fn begin_close(&self, connection_id: &str, code: u16) {
        self.write(|inner| {
            if let Some(connection) = inner.connections.get_mut(connection_id) {
                if connection.state < ConnectionState::Closing {
                    connection.state = ConnectionState::Closing;
                    let _ = connection.sender.try_send(Outbound::Close(code));
                }
            }
        });
    }

    /// Remove a connection, unmapping every index. Returns the channels
    /// that lost their last subscriber.
    pub fn remove(&self, connection_id: &str) -> Vec<String> {
        self.write(|inner| {
            let Some(mut connection) = inner.connections.remove(connection_id) else {
                return Vec::new();
            };
            connection.state = ConnectionState::Closed;
            metrics::gauge!("broker.connections").decrement(1.0);

            if let Some(count) = inner.per_identity.get_mut(&connection.identity.user_id) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    inner.per_identity.remove(&connection.identity.user_id);
                }
            }
            if let Some(members) = inner.sites.get_mut(&connection.identity.site_id) {
                members.remove(connection_id);
                if members.is_empty() {
                    inner.sites.remove(&connection.identity.site_id);
                }
            }

            let mut emptied = Vec::new();
            for channel in &connection.subscriptions {
                if let Some(subscribers) = inner.channels.get_mut(channel) {
                    subscribers.remove(connection_id);
                    if subscribers.is_empty() {
                        inner.channels.remove(channel);
                        emptied.push(channel.clone());
                    }
                }
            }
            emptied
        })
    }

    /// Every connection id (used by shutdown).
    #[must_use]
    pub fn connection_ids(&self) -> Vec<String> {
        self.read(|inner| inner.connections.keys().cloned().collect())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn identity(user: &str) -> Identity {
        Identity {
            user_id: user.to_string(),
            site_id: "site-1".to_string(),
            org_id: "org-1".to_string(),
            role: "viewer".to_string(),
        }
    }

    fn notification() -> ServerFrame {
        ServerFrame::Notification {
            channel: Some("site:site-1:notifications".to_string()),
            data: serde_json::json!({ "n": 1 }),
            timestamp: Utc::now(),
        }
    }

    fn open_connection(
        registry: &ConnectionRegistry,
        user: &str,
        buffer: usize,
    ) -> (String, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(buffer);
        let id = registry
            .register(identity(user), Transport::WebSocket, tx, 8)
            .unwrap();
        registry.open(&id);
        (id, rx)
    }

    #[test]
    fn register_enforces_identity_limit() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        registry
            .register(identity("u-1"), Transport::WebSocket, tx.clone(), 1)
            .unwrap();

        let second = registry.register(identity("u-1"), Transport::WebSocket, tx, 1);
        assert!(matches!(second, Err(BrokerError::ConnectionLimit)));
    }

    #[test]
    fn subscribe_requires_open_state() {
        let registry = ConnectionRegistry::new();
        let (tx, _rx) = mpsc::channel(4);
        let id = registry
            .register(identity("u-1"), Transport::WebSocket, tx, 8)
            .unwrap();

        // Still Connecting.
        assert!(matches!(
            registry.subscribe(&id, "public:x"),
            Err(BrokerError::NotOpen)
        ));

        registry.open(&id);
        assert!(registry.subscribe(&id, "public:x").unwrap());
    }

    #[test]
    fn first_and_last_subscriber_are_reported() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = open_connection(&registry, "u-1", 4);
        let (b, _rx_b) = open_connection(&registry, "u-2", 4);

        assert!(registry.subscribe(&a, "public:x").unwrap());
        assert!(!registry.subscribe(&b, "public:x").unwrap());

        assert!(!registry.unsubscribe(&a, "public:x"));
        assert!(registry.unsubscribe(&b, "public:x"));
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = open_connection(&registry, "u-1", 4);
        registry.subscribe(&a, "public:x").unwrap();

        assert!(registry.unsubscribe(&a, "public:x"));
        assert!(registry.unsubscribe(&a, "public:x"));
        assert!(!registry.is_subscribed(&a, "public:x"));
    }

    #[test]
    fn broadcast_reaches_open_subscribers_only() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = open_connection(&registry, "u-1", 4);
        let (_b, mut rx_b) = open_connection(&registry, "u-2", 4);
        registry.subscribe(&a, "public:x").unwrap();

        let stats = registry.broadcast("public:x", &notification());
        assert_eq!(stats.delivered, 1);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn full_writer_sheds_frames_without_blocking_siblings() {
        let registry = ConnectionRegistry::new();
        // Buffer of 1 that is never drained.
        let (slow, _rx_slow) = open_connection(&registry, "u-1", 1);
        let (fast, mut rx_fast) = open_connection(&registry, "u-2", 16);
        registry.subscribe(&slow, "public:x").unwrap();
        registry.subscribe(&fast, "public:x").unwrap();

        let first = registry.broadcast("public:x", &notification());
        assert_eq!(first.delivered, 2);

        let second = registry.broadcast("public:x", &notification());
        assert_eq!(second.delivered, 1, "fast sibling still served");
        assert_eq!(second.dropped, 1, "slow connection shed the frame");

        assert!(rx_fast.try_recv().is_ok());
        assert!(rx_fast.try_recv().is_ok());
    }

    #[test]
    fn site_broadcast_reaches_all_site_connections() {
        let registry = ConnectionRegistry::new();
        let (_a, mut rx_a) = open_connection(&registry, "u-1", 4);
        let (_b, mut rx_b) = open_connection(&registry, "u-2", 4);

        let stats = registry.broadcast_site("site-1", &notification());
        assert_eq!(stats.delivered, 2);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn sweep_pings_alive_and_reports_dead() {
        let registry = ConnectionRegistry::new();
        let (a, mut rx_a) = open_connection(&registry, "u-1", 4);

        // First sweep: alive → ping, not dead.
        assert!(registry.sweep().is_empty());
        assert_eq!(rx_a.try_recv().unwrap(), Outbound::Ping);

        // No pong arrived: second sweep reports it dead.
        let dead = registry.sweep();
        assert_eq!(dead, vec![a.clone()]);

        // A pong would have saved it.
        registry.mark_alive(&a);
        assert!(registry.sweep().is_empty());
    }

    #[test]
    fn sweep_with_no_connections_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        assert!(registry.sweep().is_empty());
    }

    #[test]
    fn remove_unmaps_everything() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = open_connection(&registry, "u-1", 4);
        registry.subscribe(&a, "public:x").unwrap();
        registry.subscribe(&a, "site:site-1:notifications").unwrap();

        let emptied = registry.remove(&a);
        assert_eq!(emptied.len(), 2);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.channel_subscribers("public:x"), 0);

        // Identity slot is freed for future connections.
        let (tx, _rx2) = mpsc::channel(4);
        assert!(registry
            .register(identity("u-1"), Transport::WebSocket, tx, 1)
            .is_ok());
    }

    #[test]
    fn subscribe_then_unsubscribe_leaves_no_trace() {
        let registry = ConnectionRegistry::new();
        let (a, _rx) = open_connection(&registry, "u-1", 4);

        registry.subscribe(&a, "public:x").unwrap();
        registry.unsubscribe(&a, "public:x");

        assert!(!registry.is_subscribed(&a, "public:x"));
        assert_eq!(registry.channel_subscribers("public:x"), 0);
    }
}
