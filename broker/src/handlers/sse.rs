//! Server-sent events transport handler.
//!
//! `EventSource` cannot set headers, so the token is taken from the
//! `token` query parameter. The stream carries the same JSON frames as
//! the WebSocket transport (`data: <json>\n\n`), starting with
//! `connection_established`. Liveness is the transport's problem here:
//! axum's keep-alive comments flow every 15 seconds, and a dropped client
//! tears the stream down, which disconnects the registry entry.

use crate::broker::{Broker, CLOSE_GOING_AWAY};
use crate::error::BrokerError;
use crate::frame::Outbound;
use crate::registry::Transport;
use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use proofpulse_pubsub::PubSub;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_stream::wrappers::ReceiverStream;

/// Disconnects the registry entry when the client drops the stream.
struct DisconnectGuard<P: PubSub + 'static> {
    broker: Arc<Broker<P>>,
    connection_id: String,
}

impl<P: PubSub + 'static> Drop for DisconnectGuard<P> {
    fn drop(&mut self) {
        let broker = Arc::clone(&self.broker);
        let connection_id = self.connection_id.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                broker.disconnect(&connection_id, CLOSE_GOING_AWAY).await;
            });
        }
    }
}

/// `GET /api/notifications/sse?shopDomain=…&token=…`.
///
/// # Errors
///
/// Returns 401 when the token is missing or invalid and 429 at the
/// connection limit.
pub async fn handle<P: PubSub + 'static>(
    Query(query): Query<HashMap<String, String>>,
    headers: http::HeaderMap,
    State(broker): State<Arc<Broker<P>>>,
) -> Result<Response, BrokerError> {
    let identity = broker.authenticate(&headers, &query)?;
    if let Some(shop_domain) = query.get("shopDomain") {
        tracing::debug!(shop_domain = %shop_domain, site_id = %identity.site_id, "SSE connect");
    }

    let (connection_id, outbound) = broker.connect(identity, Transport::Sse).await?;
    let guard = DisconnectGuard {
        broker,
        connection_id,
    };

    let stream = ReceiverStream::new(outbound)
        .take_while(|command| {
            futures::future::ready(!matches!(command, Outbound::Close(_)))
        })
        .filter_map(move |command| {
            // The guard lives inside the stream; dropping the stream
            // disconnects the registry entry.
            let _guard = &guard;
            let event = match command {
                Outbound::Frame(frame) => serde_json::to_string(&frame)
                    .ok()
                    .map(|json| Ok::<_, Infallible>(Event::default().data(json))),
                // Heartbeat pings are a WebSocket concern; keep-alive
                // comments cover SSE.
                Outbound::Ping | Outbound::Close(_) => None,
            };
            futures::future::ready(event)
        });

    let mut response = Sse::new(stream)
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response();

    let headers = response.headers_mut();
    headers.insert(
        http::header::CACHE_CONTROL,
        http::HeaderValue::from_static("no-cache"),
    );
    headers.insert(
        http::header::CONNECTION,
        http::HeaderValue::from_static("keep-alive"),
    );
    Ok(response)
}
