//! The client/server frame protocol.
//!
//! All frames are JSON with a `type` discriminator. Unknown client frame
//! types fail to parse and are answered with an `error` frame rather than
//! dropped silently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Frames a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Subscribe to a channel.
    Subscribe {
        /// Channel to subscribe to.
        channel: String,
        /// Optional client-side filters, passed through untouched.
        #[serde(default)]
        filters: Option<serde_json::Value>,
    },
    /// Unsubscribe from a channel.
    Unsubscribe {
        /// Channel to leave.
        channel: String,
    },
    /// Application-level liveness probe.
    Ping,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerFrame {
    /// Welcome frame with the assigned connection id.
    Connection {
        /// Assigned connection id.
        connection_id: String,
        /// Human-readable greeting.
        message: String,
    },
    /// First frame on an SSE stream.
    ConnectionEstablished {
        /// Assigned connection id.
        connection_id: String,
    },
    /// Subscription confirmed.
    Subscribed {
        /// The channel.
        channel: String,
    },
    /// Unsubscription confirmed.
    Unsubscribed {
        /// The channel.
        channel: String,
    },
    /// Reply to a client ping.
    Pong {
        /// Server time, epoch milliseconds.
        timestamp: i64,
    },
    /// A delivered notification.
    Notification {
        /// Originating channel; absent for site-wide broadcasts.
        #[serde(skip_serializing_if = "Option::is_none")]
        channel: Option<String>,
        /// Notification payload.
        data: serde_json::Value,
        /// Delivery time.
        timestamp: DateTime<Utc>,
    },
    /// Something went wrong with the client's last frame.
    Error {
        /// What went wrong.
        message: String,
    },
}

/// Commands flowing to a connection's single writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Serialize and send a frame.
    Frame(ServerFrame),
    /// Transport-level ping (WebSocket heartbeats).
    Ping,
    /// Close the connection with a code (1001 going away, 1008 policy).
    Close(u16),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_parse() {
        let subscribe: ClientFrame = serde_json::from_value(json!({
            "type": "subscribe",
            "channel": "site:S1:notifications"
        }))
        .unwrap();
        assert_eq!(
            subscribe,
            ClientFrame::Subscribe {
                channel: "site:S1:notifications".to_string(),
                filters: None
            }
        );

        let ping: ClientFrame = serde_json::from_value(json!({ "type": "ping" })).unwrap();
        assert_eq!(ping, ClientFrame::Ping);
    }

    #[test]
    fn unknown_client_frame_types_fail_to_parse() {
        let result: Result<ClientFrame, _> =
            serde_json::from_value(json!({ "type": "takeover" }));
        assert!(result.is_err());
    }

    #[test]
    fn server_frames_use_the_wire_shape() {
        let frame = ServerFrame::Connection {
            connection_id: "conn-1".to_string(),
            message: "welcome".to_string(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "connection");
        assert_eq!(value["connectionId"], "conn-1");

        let sse = ServerFrame::ConnectionEstablished {
            connection_id: "conn-2".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&sse).unwrap()["type"],
            "connection_established"
        );
    }

    #[test]
    fn notification_frame_omits_absent_channel() {
        let frame = ServerFrame::Notification {
            channel: None,
            data: json!({ "customerName": "Ana" }),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["type"], "notification");
        assert!(value.get("channel").is_none());
        assert_eq!(value["data"]["customerName"], "Ana");
    }
}
