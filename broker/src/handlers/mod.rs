//! Transport handlers and route wiring.

pub mod sse;
pub mod websocket;

use crate::broker::Broker;
use axum::routing::get;
use axum::Router;
use proofpulse_pubsub::PubSub;
use std::sync::Arc;

/// Build the broker's routes: `GET /ws` and
/// `GET /api/notifications/sse`.
pub fn router<P: PubSub + 'static>(broker: Arc<Broker<P>>) -> Router {
    Router::new()
        .route("/ws", get(websocket::handle::<P>))
        .route("/api/notifications/sse", get(sse::handle::<P>))
        .with_state(broker)
}
