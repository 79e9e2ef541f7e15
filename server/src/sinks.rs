//! Adapters between the pipeline crates.
//!
//! Each infrastructure crate exposes a narrow trait at its seam; this
//! module implements them against the real neighbors so the crates stay
//! decoupled from each other.

use proofpulse_bus::{EventHandler, HandlerError, MessageContext, ProduceOptions};
use proofpulse_core::Event;
use proofpulse_materializer::{AnalyticsRecord, AnalyticsSink, Materializer, TemplateStore};
use proofpulse_queue::QueueBackend;
use proofpulse_store::{EventStore, ReplaySink};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Bus-backed sink for webhook ingress and replay.
pub struct BusEventSink {
    producer: Arc<proofpulse_bus::EventProducer>,
}

impl BusEventSink {
    /// Wrap a producer.
    #[must_use]
    pub fn new(producer: Arc<proofpulse_bus::EventProducer>) -> Self {
        Self { producer }
    }
}

impl proofpulse_ingress::EventSink for BusEventSink {
    fn produce(
        &self,
        event: Event,
    ) -> Pin<Box<dyn Future<Output = Result<Event, String>> + Send + '_>> {
        Box::pin(async move {
            self.producer
                .produce_event(&event, ProduceOptions::default())
                .await
                .map_err(|e| e.to_string())
        })
    }
}

impl ReplaySink for BusEventSink {
    async fn publish(&self, event: &Event, topic: &str) -> Result<(), String> {
        let payload = serde_json::to_value(event).map_err(|e| e.to_string())?;
        self.producer
            .produce(topic, &payload, Some(event.partition_key()))
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}

/// The consumer-side pipeline: persist the event, then materialize it.
///
/// Errors propagate as handler failures so the consumer holds the offset
/// and the event is redelivered - both the store and the materializer are
/// idempotent enough for at-least-once.
pub struct PipelineHandler<S, B, E>
where
    S: TemplateStore + Send + Sync + 'static,
    B: QueueBackend + 'static,
    E: EventStore + 'static,
{
    materializer: Arc<Materializer<S, B>>,
    store: Arc<E>,
}

impl<S, B, E> PipelineHandler<S, B, E>
where
    S: TemplateStore + Send + Sync + 'static,
    B: QueueBackend + 'static,
    E: EventStore + 'static,
{
    /// Assemble the handler.
    #[must_use]
    pub fn new(materializer: Arc<Materializer<S, B>>, store: Arc<E>) -> Self {
        Self {
            materializer,
            store,
        }
    }
}

impl<S, B, E> EventHandler for PipelineHandler<S, B, E>
where
    S: TemplateStore + Send + Sync + 'static,
    B: QueueBackend + 'static,
    E: EventStore + 'static,
{
    fn handle(
        &self,
        event: Event,
        context: MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>> {
        Box::pin(async move {
            self.store
                .store(&event)
                .await
                .map_err(|e| HandlerError::new(format!("event store: {e}")))?;

            let outcomes = self
                .materializer
                .process_event(&event)
                .await
                .map_err(|e| HandlerError::new(format!("materializer: {e}")))?;

            tracing::debug!(
                event_id = %event.id,
                topic = %context.topic,
                offset = context.offset,
                notifications = outcomes.len(),
                "Event processed"
            );
            Ok(())
        })
    }
}

/// Analytics sink that turns records into logs and counters.
pub struct LoggingAnalytics;

impl AnalyticsSink for LoggingAnalytics {
    fn record(&self, record: AnalyticsRecord) {
        metrics::counter!(
            "analytics.notifications",
            "status" => record.status,
            "event_type" => record.event_type.clone()
        )
        .increment(1);
        tracing::debug!(
            notification_id = %record.notification_id,
            site_id = %record.site_id,
            template_id = %record.template_id,
            status = record.status,
            filter_reason = ?record.filter_reason,
            "Notification decision"
        );
    }
}
