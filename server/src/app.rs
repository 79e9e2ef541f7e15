//! Component wiring and the service lifecycle.
//!
//! Startup order: metrics recorder → schema registry → bus producer →
//! Redis (queues + pub/sub) → Postgres (event store, migrations) →
//! materializer → broker → consumer → delivery workers → HTTP.
//!
//! Shutdown (SIGTERM/SIGINT) runs the reverse: stop accepting HTTP and
//! close realtime sockets with 1001, drain the consumer's in-flight
//! handlers with a 10s budget, stop the workers, close pub/sub, and flush
//! the bus producer. A clean pass exits 0.

use crate::config::ServerConfig;
use crate::health::{aggregate, basic, ComponentHealth, DetailedHealth};
use crate::sinks::{BusEventSink, LoggingAnalytics, PipelineHandler};
use crate::workers::DeliveryWorker;
use anyhow::Context;
use axum::routing::get;
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusBuilder;
use proofpulse_broker::{AuthConfig, Broker, BrokerConfig};
use proofpulse_bus::{ConsumerConfig, EventConsumer, EventProducer};
use proofpulse_core::SchemaRegistry;
use proofpulse_ingress::{
    IngressState, ShopifyProvider, StaticShopDirectory, StripeProvider, WooCommerceProvider,
};
use proofpulse_materializer::{Materializer, Renderer, RendererConfig, RulePolicies};
use proofpulse_materializer::InMemoryTemplateStore;
use proofpulse_pubsub::{PubSub, RedisBus};
use proofpulse_queue::{QueueBackend, RedisBackend};
use proofpulse_store::{EventStore, PostgresEventStore};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Topics the materializer consumes.
const CONSUMED_TOPICS: [&str; 3] = ["order-events", "user-events", "signup-events"];
/// Delivery channels with a worker.
const DELIVERY_CHANNELS: [&str; 2] = ["web", "email"];
/// Consumer drain budget on shutdown.
const CONSUMER_DRAIN: Duration = Duration::from_secs(10);

/// Build every component, serve until a shutdown signal, tear down.
///
/// # Errors
///
/// Returns an error for any fatal init failure (bad config reaches here
/// as unreachable backends); the caller maps it to exit code 1.
pub async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;

    let registry = Arc::new(SchemaRegistry::with_builtins());

    let producer = Arc::new(
        EventProducer::builder()
            .brokers(&config.brokers)
            .client_id(&config.client_id)
            .build(Arc::clone(&registry))
            .context("failed to create bus producer")?,
    );

    let queue_backend = Arc::new(
        RedisBackend::connect(&config.pubsub_url)
            .await
            .context("failed to connect queue backend")?,
    );
    let pubsub = RedisBus::connect(&config.pubsub_url)
        .await
        .context("failed to connect pub/sub")?;

    let event_store = Arc::new(
        PostgresEventStore::connect(&config.database_url)
            .await
            .context("failed to connect event store")?,
    );
    event_store
        .migrate()
        .await
        .context("failed to run event store migrations")?;

    // Template and policy reads come from the surrounding platform; the
    // in-memory store serves single-tenant deployments until one is wired.
    let template_store = Arc::new(InMemoryTemplateStore::new());
    let materializer = Arc::new(
        Materializer::new(
            Arc::clone(&template_store),
            Arc::clone(&queue_backend),
            Arc::new(Renderer::new(RendererConfig::default())),
            RulePolicies::default(),
        )
        .with_analytics(Arc::new(LoggingAnalytics)),
    );

    let broker = Arc::new(Broker::new(
        pubsub.clone(),
        &AuthConfig {
            secret: config.jwt_secret.clone(),
            issuer: config.jwt_issuer.clone(),
            audience: config.jwt_audience.clone(),
        },
        BrokerConfig::default(),
    ));

    let mut directory = StaticShopDirectory::new();
    if let Some(seed) = &config.seed_shop {
        directory = directory.with_shop(
            &seed.shop_domain,
            &seed.organization_id,
            &seed.site_id,
        );
        tracing::info!(shop = %seed.shop_domain, site = %seed.site_id, "Seeded shop directory");
    }
    let ingress_state = IngressState::new(
        Arc::new(directory),
        Arc::new(BusEventSink::new(Arc::clone(&producer))),
    )
    .with_provider(Arc::new(ShopifyProvider::new(config.shopify_secret.clone())))
    .with_provider(Arc::new(WooCommerceProvider::new(
        config.woocommerce_secret.clone(),
    )))
    .with_provider(Arc::new(StripeProvider::new(config.stripe_secret.clone())));

    let consumer = EventConsumer::new(
        ConsumerConfig::new(&config.client_id, &config.brokers, &config.group_id)
            .topics(CONSUMED_TOPICS),
        Arc::clone(&registry),
    )
    .with_event_handler(Arc::new(PipelineHandler::new(
        Arc::clone(&materializer),
        Arc::clone(&event_store),
    )));
    let consumer_handle = consumer.start().await.context("failed to start consumer")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let pubsub_arc = Arc::new(pubsub.clone());
    let mut worker_tasks = Vec::new();
    for channel in DELIVERY_CHANNELS {
        let worker = DeliveryWorker::new(
            Arc::clone(&queue_backend),
            Arc::clone(&pubsub_arc),
            channel,
        );
        worker_tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    let heartbeat = tokio::spawn(Arc::clone(&broker).run_heartbeat(shutdown_rx.clone()));

    let app = router(
        &config,
        ingress_state,
        Arc::clone(&broker),
        Arc::clone(&event_store),
        Arc::clone(&queue_backend),
        pubsub.clone(),
        prometheus,
    );

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port))
        .await
        .with_context(|| format!("failed to bind port {}", config.port))?;
    tracing::info!(
        service = %config.service_name,
        port = config.port,
        "ProofPulse listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_tx.clone(), Arc::clone(&broker)))
        .await
        .context("server error")?;

    // HTTP has drained and sockets are closed; wind down the pipeline.
    let drained = consumer_handle.stop(CONSUMER_DRAIN).await;
    if !drained {
        tracing::warn!("Consumer did not drain within budget");
    }
    let _ = shutdown_tx.send(true);
    for task in worker_tasks {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    let _ = tokio::time::timeout(Duration::from_secs(5), heartbeat).await;
    pubsub.close();
    if let Err(e) = producer.flush(Duration::from_secs(5)) {
        tracing::warn!(error = %e, "Producer flush incomplete");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

#[allow(clippy::needless_pass_by_value)] // Handles are cheap clones owned by the router.
fn router(
    config: &ServerConfig,
    ingress_state: IngressState,
    broker: Arc<Broker<RedisBus>>,
    event_store: Arc<PostgresEventStore>,
    queue_backend: Arc<RedisBackend>,
    pubsub: RedisBus,
    prometheus: metrics_exporter_prometheus::PrometheusHandle,
) -> Router {
    let service_name = config.service_name.clone();
    let basic_service = service_name.clone();

    Router::new()
        .merge(proofpulse_ingress::router(ingress_state))
        .merge(proofpulse_broker::router(broker))
        .route(
            "/health",
            get(move || {
                let service = basic_service.clone();
                async move { basic(&service) }
            }),
        )
        .route(
            "/health/detailed",
            get(move || {
                let service = service_name.clone();
                let store = Arc::clone(&event_store);
                let queue = Arc::clone(&queue_backend);
                let pubsub = pubsub.clone();
                async move {
                    let mut components = BTreeMap::new();
                    components.insert(
                        "event_store",
                        match store.health_check().await {
                            Ok(()) => ComponentHealth::healthy(),
                            Err(e) => ComponentHealth::unhealthy(e.to_string()),
                        },
                    );
                    components.insert(
                        "queue",
                        match queue.len("health:probe").await {
                            Ok(_) => ComponentHealth::healthy(),
                            Err(e) => ComponentHealth::unhealthy(e.to_string()),
                        },
                    );
                    components.insert(
                        "pubsub",
                        match pubsub
                            .publish("health:ping", &serde_json::json!({ "ping": true }))
                            .await
                        {
                            Ok(_) => ComponentHealth::healthy(),
                            Err(e) => ComponentHealth::unhealthy(e.to_string()),
                        },
                    );

                    let (level, status) = aggregate(&components);
                    (
                        status,
                        Json(DetailedHealth {
                            status: level,
                            service,
                            components,
                        }),
                    )
                }
            }),
        )
        .route(
            "/metrics",
            get(move || {
                let handle = prometheus.clone();
                async move { handle.render() }
            }),
        )
}

/// Resolve on SIGTERM/SIGINT: flip the shutdown flag and close realtime
/// connections so the HTTP server can drain.
async fn shutdown_signal(
    shutdown_tx: watch::Sender<bool>,
    broker: Arc<Broker<RedisBus>>,
) {
    let ctrl_c = async {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("Shutdown signal received; closing connections");
    let _ = shutdown_tx.send(true);
    broker.shutdown().await;
}
