//! WebSocket transport handler.
//!
//! The socket is split into a single writer task draining the
//! connection's outbound queue and an inline reader loop feeding client
//! frames to the broker. Protocol pongs keep the heartbeat alive; JSON
//! frames follow the subscribe/unsubscribe/ping protocol.

use crate::broker::{Broker, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION};
use crate::error::BrokerError;
use crate::frame::Outbound;
use crate::registry::Transport;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use proofpulse_pubsub::PubSub;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// `GET /ws` - authenticate, then upgrade.
///
/// # Errors
///
/// Returns 401 before the upgrade when the token is missing or invalid.
pub async fn handle<P: PubSub + 'static>(
    ws: WebSocketUpgrade,
    Query(query): Query<HashMap<String, String>>,
    headers: http::HeaderMap,
    State(broker): State<Arc<Broker<P>>>,
) -> Result<Response, BrokerError> {
    let identity = broker.authenticate(&headers, &query)?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, broker, identity)))
}

async fn handle_socket<P: PubSub + 'static>(
    mut socket: WebSocket,
    broker: Arc<Broker<P>>,
    identity: crate::auth::Identity,
) {
    let (connection_id, mut outbound) = match broker.connect(identity, Transport::WebSocket).await
    {
        Ok(connected) => connected,
        Err(e) => {
            // Post-upgrade failures (connection limit) close with policy
            // violation.
            tracing::warn!(error = %e, "Connection rejected after upgrade");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: CLOSE_POLICY_VIOLATION,
                    reason: e.to_string().into(),
                })))
                .await;
            return;
        }
    };

    let (mut sink, mut stream) = socket.split();

    // Single writer: the only task that touches the sink, so frames are
    // never interleaved.
    let mut writer = tokio::spawn(async move {
        while let Some(command) = outbound.recv().await {
            let result = match command {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => sink.send(Message::Text(json)).await,
                    Err(e) => {
                        tracing::error!(error = %e, "Frame serialization failed");
                        Ok(())
                    }
                },
                Outbound::Ping => sink.send(Message::Ping(Vec::new())).await,
                Outbound::Close(code) => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "".into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => {
                let reply = broker.handle_frame(&connection_id, &text).await;
                let _ = broker.registry().send_to(&connection_id, reply);
            }
            Message::Pong(_) => broker.registry().mark_alive(&connection_id),
            Message::Ping(_) => {
                // Axum answers protocol pings automatically.
            }
            Message::Close(_) => break,
            Message::Binary(_) => {
                tracing::warn!(connection_id = %connection_id, "Ignoring binary frame");
            }
        }
    }

    broker.disconnect(&connection_id, CLOSE_GOING_AWAY).await;
    // The writer drains the close frame and exits on its own; don't leave
    // it behind if the sink is wedged.
    if tokio::time::timeout(Duration::from_secs(5), &mut writer).await.is_err() {
        tracing::warn!(connection_id = %connection_id, "Writer did not drain; aborting");
        writer.abort();
    }
}
