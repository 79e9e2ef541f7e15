//! Event bus producer.
//!
//! The producer owns topic derivation and header propagation: callers hand
//! it canonical [`Event`]s and it validates (migrating old versions forward),
//! derives the primary topic, attaches the tracing headers the consumers
//! rely on, and partitions by organization so a tenant's events stay
//! ordered.
//!
//! # Delivery
//!
//! Sends are acknowledged by the broker before the returned future resolves;
//! batch publishes group events per topic and drop schema-invalid events
//! with a warning rather than failing the whole batch.

use crate::error::BusError;
use chrono::Utc;
use proofpulse_core::schema::SchemaRegistry;
use proofpulse_core::Event;
use rdkafka::config::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Options for a single [`EventProducer::produce_event`] call.
#[derive(Debug, Clone, Default)]
pub struct ProduceOptions {
    /// Explicit partition key; defaults to the event's partition key.
    pub key: Option<String>,
    /// Pin the record to a specific partition.
    pub partition: Option<i32>,
    /// Extra headers appended after the standard set.
    pub headers: Vec<(String, String)>,
}

/// Outcome of a batch publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Events acknowledged by the broker.
    pub published: usize,
    /// Events dropped because they failed validation.
    pub dropped: usize,
}

/// Builder for [`EventProducer`].
#[derive(Default)]
pub struct EventProducerBuilder {
    brokers: Option<String>,
    client_id: Option<String>,
    acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
}

impl EventProducerBuilder {
    /// Set the comma-separated broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the client id stamped into the `producer-id` header.
    #[must_use]
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// Set the acknowledgment mode (`"0"`, `"1"`, `"all"`). Default: `"1"`.
    #[must_use]
    pub fn acks(mut self, acks: impl Into<String>) -> Self {
        self.acks = Some(acks.into());
        self
    }

    /// Set the compression codec. Default: none.
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the per-send timeout. Default: 5 seconds.
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Build the producer.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] when brokers are missing or
    /// the underlying client rejects the configuration.
    pub fn build(self, registry: Arc<SchemaRegistry>) -> Result<EventProducer, BusError> {
        let brokers = self
            .brokers
            .ok_or_else(|| BusError::ConnectionFailed("Brokers not configured".to_string()))?;
        let client_id = self.client_id.unwrap_or_else(|| "proofpulse".to_string());

        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &brokers)
            .set("client.id", &client_id)
            .set("message.timeout.ms", "5000")
            .set("acks", self.acks.as_deref().unwrap_or("1"))
            .set(
                "compression.type",
                self.compression.as_deref().unwrap_or("none"),
            );

        let producer: FutureProducer = config
            .create()
            .map_err(|e| BusError::ConnectionFailed(format!("Failed to create producer: {e}")))?;

        tracing::info!(
            brokers = %brokers,
            client_id = %client_id,
            "Event producer created"
        );

        Ok(EventProducer {
            producer,
            client_id,
            registry,
            timeout: self.timeout.unwrap_or(Duration::from_secs(5)),
        })
    }
}

/// JSON-over-Kafka event producer.
///
/// # Example
///
/// ```no_run
/// use proofpulse_bus::producer::{EventProducer, ProduceOptions};
/// use proofpulse_core::{Event, SchemaRegistry};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let registry = Arc::new(SchemaRegistry::with_builtins());
/// let producer = EventProducer::builder()
///     .brokers("localhost:9092")
///     .client_id("ingress-1")
///     .build(registry)?;
///
/// let event = Event::new(
///     "order.created",
///     "1.0.0",
///     "shopify",
///     "org-1",
///     serde_json::json!({
///         "orderId": "1001",
///         "total": 49.99,
///         "currency": "USD",
///         "products": []
///     }),
/// );
/// producer.produce_event(&event, ProduceOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
pub struct EventProducer {
    producer: FutureProducer,
    client_id: String,
    registry: Arc<SchemaRegistry>,
    timeout: Duration,
}

impl EventProducer {
    /// Start building a producer.
    #[must_use]
    pub fn builder() -> EventProducerBuilder {
        EventProducerBuilder::default()
    }

    /// Publish a raw JSON payload to an explicit topic.
    ///
    /// Attaches the `{content-type, producer-id, timestamp}` header set.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] when the broker rejects or times
    /// out the send.
    pub async fn produce(
        &self,
        topic: &str,
        payload: &serde_json::Value,
        key: Option<&str>,
    ) -> Result<(i32, i64), BusError> {
        let body = serde_json::to_vec(payload).map_err(|e| BusError::PublishFailed {
            topic: topic.to_string(),
            reason: format!("Failed to serialize payload: {e}"),
        })?;

        let headers = self.base_headers();
        self.send(topic, &body, key, None, headers).await
    }

    /// Validate, migrate, and publish a canonical event to its derived topic.
    ///
    /// Returns the event that was actually sent - the migrated form when the
    /// registry moved it forward, otherwise a clone of the input.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::InvalidEvent`] when validation fails and
    /// [`BusError::PublishFailed`] on broker errors.
    pub async fn produce_event(
        &self,
        event: &Event,
        options: ProduceOptions,
    ) -> Result<Event, BusError> {
        let (event, migrated) = self.prepare(event)?;
        let topic = event.topic();

        let body = serde_json::to_vec(&event).map_err(|e| BusError::PublishFailed {
            topic: topic.clone(),
            reason: format!("Failed to serialize event: {e}"),
        })?;

        let mut headers = self.base_headers();
        for (key, value) in event_headers(&event, migrated) {
            headers = headers.insert(Header {
                key,
                value: Some(value.as_str()),
            });
        }
        for (key, value) in &options.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let key = options
            .key
            .clone()
            .unwrap_or_else(|| event.partition_key().to_string());

        let (partition, offset) = self
            .send(&topic, &body, Some(&key), options.partition, headers)
            .await?;

        tracing::debug!(
            topic = %topic,
            partition = partition,
            offset = offset,
            event_id = %event.id,
            event_type = %event.event_type,
            migrated = migrated,
            "Event published"
        );
        metrics::counter!("bus.events_produced", "topic" => topic).increment(1);

        Ok(event)
    }

    /// Publish a batch of events, grouped per topic.
    ///
    /// Invalid events are dropped with a warning; an empty input returns
    /// without touching the bus at all.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] if any send in the batch fails
    /// after validation.
    pub async fn produce_batch(&self, events: &[Event]) -> Result<BatchReport, BusError> {
        if events.is_empty() {
            return Ok(BatchReport::default());
        }

        let (groups, dropped) = self.group_by_topic(events);
        let mut report = BatchReport {
            published: 0,
            dropped,
        };

        for (topic, batch) in groups {
            let mut sent: u64 = 0;
            for event in batch {
                let body = serde_json::to_vec(&event).map_err(|e| BusError::PublishFailed {
                    topic: topic.clone(),
                    reason: format!("Failed to serialize event: {e}"),
                })?;

                let mut headers = self.base_headers();
                let migrated = event
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("migrated"))
                    .and_then(serde_json::Value::as_bool)
                    .unwrap_or(false);
                for (key, value) in event_headers(&event, migrated) {
                    headers = headers.insert(Header {
                        key,
                        value: Some(value.as_str()),
                    });
                }

                let key = event.partition_key().to_string();
                self.send(&topic, &body, Some(&key), None, headers).await?;
                report.published += 1;
                sent += 1;
            }
            metrics::counter!("bus.events_produced", "topic" => topic.clone()).increment(sent);
        }

        Ok(report)
    }

    /// Flush in-flight sends (graceful shutdown).
    ///
    /// # Errors
    ///
    /// Returns [`BusError::PublishFailed`] when the flush does not
    /// complete within the timeout.
    pub fn flush(&self, timeout: Duration) -> Result<(), BusError> {
        use rdkafka::producer::Producer;
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|e| BusError::PublishFailed {
                topic: "*".to_string(),
                reason: format!("flush failed: {e}"),
            })
    }

    /// Validate and migrate an event, splitting the outcome for callers.
    fn prepare(&self, event: &Event) -> Result<(Event, bool), BusError> {
        let outcome = self.registry.validate(event);
        if !outcome.valid {
            return Err(BusError::InvalidEvent {
                event_type: event.event_type.clone(),
                reason: outcome.errors.join("; "),
            });
        }
        match outcome.migrated_event {
            Some(migrated) => Ok((migrated, true)),
            None => Ok((event.clone(), false)),
        }
    }

    /// Group a slice of events by derived topic, dropping invalid ones.
    fn group_by_topic(&self, events: &[Event]) -> (HashMap<String, Vec<Event>>, usize) {
        let mut groups: HashMap<String, Vec<Event>> = HashMap::new();
        let mut dropped = 0;

        for event in events {
            match self.prepare(event) {
                Ok((prepared, _)) => {
                    groups.entry(prepared.topic()).or_default().push(prepared);
                }
                Err(e) => {
                    tracing::warn!(
                        event_id = %event.id,
                        event_type = %event.event_type,
                        error = %e,
                        "Dropping invalid event from batch"
                    );
                    metrics::counter!("bus.events_dropped_invalid").increment(1);
                    dropped += 1;
                }
            }
        }

        (groups, dropped)
    }

    fn base_headers(&self) -> OwnedHeaders {
        let timestamp = Utc::now().to_rfc3339();
        OwnedHeaders::new()
            .insert(Header {
                key: "content-type",
                value: Some("application/json"),
            })
            .insert(Header {
                key: "producer-id",
                value: Some(self.client_id.as_str()),
            })
            .insert(Header {
                key: "timestamp",
                value: Some(timestamp.as_str()),
            })
    }

    async fn send(
        &self,
        topic: &str,
        body: &[u8],
        key: Option<&str>,
        partition: Option<i32>,
        headers: OwnedHeaders,
    ) -> Result<(i32, i64), BusError> {
        let mut record = FutureRecord::<str, [u8]>::to(topic)
            .payload(body)
            .headers(headers);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(partition) = partition {
            record = record.partition(partition);
        }

        match self.producer.send(record, Timeout::After(self.timeout)).await {
            Ok(delivery) => Ok(delivery),
            Err((kafka_error, _)) => {
                tracing::error!(topic = %topic, error = %kafka_error, "Failed to publish");
                Err(BusError::PublishFailed {
                    topic: topic.to_string(),
                    reason: kafka_error.to_string(),
                })
            }
        }
    }
}

/// The standard event header set consumers use for routing and tracing.
fn event_headers(event: &Event, migrated: bool) -> Vec<(&'static str, String)> {
    let mut headers = vec![
        ("event-type", event.event_type.clone()),
        ("event-version", event.version.clone()),
        ("organization-id", event.organization_id.clone()),
        ("migrated", migrated.to_string()),
    ];
    if let Some(site_id) = &event.site_id {
        headers.push(("site-id", site_id.clone()));
    }
    if let Some(correlation_id) = &event.correlation_id {
        headers.push(("correlation-id", correlation_id.clone()));
    }
    headers
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_producer() -> EventProducer {
        // Creating the client does not connect; only sends touch the network.
        EventProducer::builder()
            .brokers("localhost:9092")
            .client_id("test-producer")
            .build(Arc::new(SchemaRegistry::with_builtins()))
            .unwrap()
    }

    fn valid_order() -> Event {
        Event::new(
            "order.created",
            "1.0.0",
            "test",
            "org-1",
            json!({
                "orderId": "1001",
                "total": 49.99,
                "currency": "USD",
                "products": [{ "title": "Mug", "price": 49.99, "quantity": 1 }]
            }),
        )
    }

    #[test]
    fn builder_requires_brokers() {
        let result =
            EventProducer::builder().build(Arc::new(SchemaRegistry::with_builtins()));
        assert!(matches!(result, Err(BusError::ConnectionFailed(_))));
    }

    #[tokio::test]
    async fn empty_batch_is_a_no_op() {
        let producer = test_producer();
        let report = producer.produce_batch(&[]).await.unwrap();
        assert_eq!(report, BatchReport::default());
    }

    #[test]
    fn batch_grouping_routes_by_topic_and_drops_invalid() {
        let producer = test_producer();
        let order = valid_order();
        let user = Event::new(
            "user.registered",
            "1.1.0",
            "test",
            "org-1",
            json!({ "userId": "u-1", "email": "a@example.com", "timezone": "UTC" }),
        );
        let invalid = Event::new("order.created", "1.0.0", "test", "org-1", json!({}));

        let (groups, dropped) =
            producer.group_by_topic(&[order, user, invalid]);
        assert_eq!(dropped, 1);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups["order-events"].len(), 1);
        assert_eq!(groups["user-events"].len(), 1);
    }

    #[test]
    fn batch_grouping_migrates_old_versions() {
        let producer = test_producer();
        let old_user = Event::new(
            "user.registered",
            "1.0.0",
            "test",
            "org-1",
            json!({ "userId": "u-1", "email": "a@example.com" }),
        );

        let (groups, dropped) = producer.group_by_topic(&[old_user]);
        assert_eq!(dropped, 0);
        let migrated = &groups["user-events"][0];
        assert_eq!(migrated.version, "1.1.0");
        assert_eq!(migrated.data["timezone"], "UTC");
    }

    #[test]
    fn invalid_event_is_rejected_before_send() {
        let producer = test_producer();
        let invalid = Event::new("order.created", "1.0.0", "test", "org-1", json!({}));
        let result = producer.prepare(&invalid);
        assert!(matches!(result, Err(BusError::InvalidEvent { .. })));
    }

    #[test]
    fn event_headers_include_routing_fields() {
        let event = valid_order()
            .with_site_id("site-1")
            .with_correlation_id("corr-1");
        let headers = event_headers(&event, true);
        let map: HashMap<_, _> = headers.into_iter().collect();

        assert_eq!(map["event-type"], "order.created");
        assert_eq!(map["event-version"], "1.0.0");
        assert_eq!(map["organization-id"], "org-1");
        assert_eq!(map["site-id"], "site-1");
        assert_eq!(map["correlation-id"], "corr-1");
        assert_eq!(map["migrated"], "true");
    }

    #[test]
    fn event_headers_omit_absent_fields() {
        let event = valid_order();
        let headers = event_headers(&event, false);
        let map: HashMap<_, _> = headers.into_iter().collect();
        assert!(!map.contains_key("site-id"));
        assert!(!map.contains_key("correlation-id"));
        assert_eq!(map["migrated"], "false");
    }
}
