//! Webhook HTTP surface.
//!
//! `POST /webhooks/:provider/*event` with the raw body captured before any
//! parsing. The response policy is deliberate: missing headers are 400 and
//! signature mismatches are 401, but once a webhook is authentic the caller
//! always gets 2xx - internal failures are logged and retried through the
//! pipeline, never bounced back to the provider where a retry storm would
//! amplify them.

use crate::directory::ShopDirectory;
use crate::error::IngressError;
use crate::provider::WebhookProvider;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use proofpulse_core::Event;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Where accepted events go. The server wires this to the bus producer;
/// tests record in memory.
pub trait EventSink: Send + Sync {
    /// Emit one normalized event.
    fn produce(
        &self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<Event, String>> + Send + '_>>;
}

/// Shared state for the webhook routes.
#[derive(Clone)]
pub struct IngressState {
    providers: Arc<HashMap<&'static str, Arc<dyn WebhookProvider>>>,
    directory: Arc<dyn ShopDirectory>,
    sink: Arc<dyn EventSink>,
}

impl IngressState {
    /// Create state with no providers registered.
    #[must_use]
    pub fn new(directory: Arc<dyn ShopDirectory>, sink: Arc<dyn EventSink>) -> Self {
        Self {
            providers: Arc::new(HashMap::new()),
            directory,
            sink,
        }
    }

    /// Register a provider under its name.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn WebhookProvider>) -> Self {
        let providers = Arc::make_mut(&mut self.providers);
        providers.insert(provider.name(), provider);
        self
    }
}

/// Build the webhook router.
pub fn router(state: IngressState) -> Router {
    Router::new()
        .route("/webhooks/:provider/*event", post(webhook_with_topic))
        .route("/webhooks/:provider", post(webhook_bare))
        .with_state(state)
}

async fn webhook_with_topic(
    State(state): State<IngressState>,
    Path((provider, event)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    process(&state, &provider, &event, &headers, &body).await
}

async fn webhook_bare(
    State(state): State<IngressState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    process(&state, &provider, "", &headers, &body).await
}

#[derive(Serialize)]
struct Accepted {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    event_id: Option<String>,
}

#[derive(Serialize)]
struct Rejection {
    success: bool,
    error: RejectionBody,
}

#[derive(Serialize)]
struct RejectionBody {
    #[serde(rename = "type")]
    kind: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

fn reject(error: &IngressError) -> Response {
    let kind = error.kind();
    metrics::counter!("ingress.webhooks_rejected", "kind" => kind.as_str()).increment(1);

    // Diagnostic details stay out of production responses.
    let details = if cfg!(debug_assertions) {
        Some(format!("{error:?}"))
    } else {
        None
    };

    let status =
        StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let body = Rejection {
        success: false,
        error: RejectionBody {
            kind: kind.as_str(),
            message: error.to_string(),
            details,
        },
    };
    (status, Json(body)).into_response()
}

fn accept(event_id: Option<String>) -> Response {
    (
        StatusCode::OK,
        Json(Accepted {
            success: true,
            event_id,
        }),
    )
        .into_response()
}

async fn process(
    state: &IngressState,
    provider_name: &str,
    path_topic: &str,
    headers: &HeaderMap,
    body: &[u8],
) -> Response {
    metrics::counter!("ingress.webhooks_received", "provider" => provider_name.to_string())
        .increment(1);

    let Some(provider) = state.providers.get(provider_name) else {
        return reject(&IngressError::UnknownProvider(provider_name.to_string()));
    };

    let topic = match provider.topic(headers, path_topic) {
        Ok(topic) => topic,
        Err(e) => return reject(&e),
    };
    let shop_domain = match provider.shop_domain(headers) {
        Ok(domain) => domain,
        Err(e) => return reject(&e),
    };
    if let Err(e) = provider.verify(headers, body) {
        tracing::warn!(
            provider = provider_name,
            shop = %shop_domain,
            error = %e,
            "Webhook rejected"
        );
        return reject(&e);
    }

    // Authentic from here on: every outcome is 2xx.
    let Some(tenant) = state.directory.resolve(&shop_domain) else {
        tracing::warn!(
            provider = provider_name,
            shop = %shop_domain,
            "Authentic webhook from unmapped shop; dropping"
        );
        metrics::counter!("ingress.unmapped_shop").increment(1);
        return accept(None);
    };

    let event = match provider.normalize(&topic, body, &tenant) {
        Ok(event) => event,
        Err(e) => {
            tracing::error!(
                provider = provider_name,
                shop = %shop_domain,
                topic = %topic,
                error = %e,
                "Failed to normalize authentic webhook"
            );
            metrics::counter!("ingress.normalization_failures").increment(1);
            return accept(None);
        }
    };

    match state.sink.produce(event).await {
        Ok(produced) => {
            tracing::info!(
                provider = provider_name,
                shop = %shop_domain,
                event_id = %produced.id,
                event_type = %produced.event_type,
                "Webhook accepted"
            );
            metrics::counter!("ingress.events_emitted", "provider" => provider_name.to_string())
                .increment(1);
            accept(Some(produced.id))
        }
        Err(e) => {
            // The provider must not retry; the failure is ours to absorb.
            tracing::error!(
                provider = provider_name,
                shop = %shop_domain,
                error = %e,
                "Failed to produce event for authentic webhook"
            );
            metrics::counter!("ingress.produce_failures").increment(1);
            accept(None)
        }
    }
}
