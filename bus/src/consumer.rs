//! Event bus consumer.
//!
//! Wraps a Kafka consumer group with at-least-once semantics: offsets are
//! committed only after the registered handler returns without error, so a
//! crash mid-handling redelivers rather than loses. Handler failures are
//! reported to an optional error sink and never stop the loop.
//!
//! # Handlers
//!
//! A consumer dispatches to exactly one of two handler shapes:
//!
//! - an [`EventHandler`], which receives canonical [`Event`]s revalidated
//!   and migrated through the schema registry before dispatch, or
//! - a [`RawMessageHandler`], which receives the parsed JSON body untouched.
//!
//! Messages whose body cannot be parsed at all are poison: they are reported
//! and committed so the group does not wedge on them.

use crate::error::{BusError, HandlerError};
use chrono::{DateTime, TimeZone, Utc};
use proofpulse_core::schema::SchemaRegistry;
use proofpulse_core::Event;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, Message};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Metadata attached to every dispatched message.
#[derive(Debug, Clone)]
pub struct MessageContext {
    /// Topic the message arrived on.
    pub topic: String,
    /// Partition within the topic.
    pub partition: i32,
    /// Offset within the partition.
    pub offset: i64,
    /// Broker timestamp, when present.
    pub timestamp: Option<DateTime<Utc>>,
    /// Partition key, when present and valid UTF-8.
    pub key: Option<String>,
    /// Message headers, lossily decoded to UTF-8.
    pub headers: HashMap<String, String>,
}

/// Handler for canonical events (revalidated and migrated before dispatch).
pub trait EventHandler: Send + Sync {
    /// Process one event. Returning an error holds the offset for redelivery.
    fn handle(
        &self,
        event: Event,
        context: MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

/// Handler for raw JSON message bodies.
pub trait RawMessageHandler: Send + Sync {
    /// Process one message body. Returning an error holds the offset.
    fn handle(
        &self,
        payload: serde_json::Value,
        context: MessageContext,
    ) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send + '_>>;
}

/// Sink for per-message failures.
///
/// Sink failures are logged and swallowed; they never affect the consumer
/// loop or the message's disposition.
pub trait ErrorSink: Send + Sync {
    /// Report one failure.
    ///
    /// # Errors
    ///
    /// A sink may itself fail (e.g. a metrics push); the consumer logs and
    /// ignores such failures.
    fn on_error(&self, error: &BusError, context: Option<&MessageContext>) -> Result<(), String>;
}

/// Consumer configuration.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Client id reported to the brokers.
    pub client_id: String,
    /// Comma-separated broker addresses.
    pub brokers: String,
    /// Consumer group id.
    pub group_id: String,
    /// Topics to subscribe to.
    pub topics: Vec<String>,
    /// Start from the earliest offset when the group has none committed.
    pub from_beginning: bool,
    /// Group session timeout. Default: 30s.
    pub session_timeout: Duration,
    /// Heartbeat interval. Default: 3s.
    pub heartbeat_interval: Duration,
    /// Max broker fetch wait. Default: 500ms.
    pub max_wait: Duration,
    /// Bounded connect attempts before `start` fails. Default: 5.
    pub connect_attempts: u32,
}

impl ConsumerConfig {
    /// Create a config with the required topology fields and defaults for
    /// the rest.
    #[must_use]
    pub fn new(
        client_id: impl Into<String>,
        brokers: impl Into<String>,
        group_id: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            brokers: brokers.into(),
            group_id: group_id.into(),
            topics: Vec::new(),
            from_beginning: false,
            session_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            max_wait: Duration::from_millis(500),
            connect_attempts: 5,
        }
    }

    /// Subscribe to a single topic.
    #[must_use]
    pub fn topic(mut self, topic: impl Into<String>) -> Self {
        self.topics.push(topic.into());
        self
    }

    /// Subscribe to several topics.
    #[must_use]
    pub fn topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics.extend(topics.into_iter().map(Into::into));
        self
    }

    /// Start from the earliest offset for new groups.
    #[must_use]
    pub const fn from_beginning(mut self, from_beginning: bool) -> Self {
        self.from_beginning = from_beginning;
        self
    }

    fn kafka_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", &self.brokers)
            .set("client.id", &self.client_id)
            .set("group.id", &self.group_id)
            .set("enable.auto.commit", "false")
            .set(
                "auto.offset.reset",
                if self.from_beginning { "earliest" } else { "latest" },
            )
            .set(
                "session.timeout.ms",
                self.session_timeout.as_millis().to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.heartbeat_interval.as_millis().to_string(),
            )
            .set("fetch.wait.max.ms", self.max_wait.as_millis().to_string())
            .set("enable.partition.eof", "false");
        config
    }
}

enum Dispatch {
    Event(Arc<dyn EventHandler>),
    Raw(Arc<dyn RawMessageHandler>),
}

/// Whether the message's offset may be committed.
#[derive(Debug, PartialEq, Eq)]
enum Disposition {
    /// Processed (or poison) - commit and move on.
    Commit,
    /// Handler failed - hold the offset so the message is redelivered.
    Hold,
}

/// A running consumer loop.
///
/// Dropping the handle detaches the loop; call [`ConsumerHandle::stop`] for
/// a graceful drain.
pub struct ConsumerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConsumerHandle {
    /// Signal shutdown and wait for in-flight handling to finish.
    ///
    /// Returns `true` when the loop drained within `timeout`; otherwise the
    /// task is aborted and `false` is returned.
    pub async fn stop(self, timeout: Duration) -> bool {
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(timeout, self.task).await {
            Ok(_) => true,
            Err(_) => {
                tracing::warn!("Consumer did not drain in time; aborting");
                false
            }
        }
    }
}

/// Kafka consumer with schema-aware dispatch and manual commits.
pub struct EventConsumer {
    config: ConsumerConfig,
    registry: Arc<SchemaRegistry>,
    dispatch: Option<Dispatch>,
    error_sink: Option<Arc<dyn ErrorSink>>,
}

impl EventConsumer {
    /// Create a consumer for the given topology.
    #[must_use]
    pub fn new(config: ConsumerConfig, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            config,
            registry,
            dispatch: None,
            error_sink: None,
        }
    }

    /// Register the event handler (revalidates and migrates before dispatch).
    #[must_use]
    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.dispatch = Some(Dispatch::Event(handler));
        self
    }

    /// Register a raw message handler instead of the event handler.
    #[must_use]
    pub fn with_raw_handler(mut self, handler: Arc<dyn RawMessageHandler>) -> Self {
        self.dispatch = Some(Dispatch::Raw(handler));
        self
    }

    /// Register an error sink for per-message failures.
    #[must_use]
    pub fn with_error_sink(mut self, sink: Arc<dyn ErrorSink>) -> Self {
        self.error_sink = Some(sink);
        self
    }

    /// Connect (with bounded exponential backoff), subscribe, and spawn the
    /// consume loop.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::ConnectionFailed`] when the brokers stay
    /// unreachable across all attempts and [`BusError::SubscriptionFailed`]
    /// when subscription is rejected.
    pub async fn start(self) -> Result<ConsumerHandle, BusError> {
        let consumer: StreamConsumer = self.config.kafka_config().create().map_err(|e| {
            BusError::ConnectionFailed(format!("Failed to create consumer: {e}"))
        })?;
        let consumer = Arc::new(consumer);

        self.await_brokers(&consumer).await?;

        let topic_refs: Vec<&str> = self.config.topics.iter().map(String::as_str).collect();
        consumer
            .subscribe(&topic_refs)
            .map_err(|e| BusError::SubscriptionFailed {
                topics: self.config.topics.clone(),
                reason: e.to_string(),
            })?;

        tracing::info!(
            topics = ?self.config.topics,
            group_id = %self.config.group_id,
            from_beginning = self.config.from_beginning,
            "Consumer subscribed"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let registry = Arc::clone(&self.registry);
        let dispatch = self.dispatch;
        let error_sink = self.error_sink;

        let task = tokio::spawn(async move {
            use futures::StreamExt;

            let mut stream = consumer.stream();
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        tracing::debug!("Consumer shutdown requested");
                        break;
                    }
                    next = stream.next() => {
                        let Some(result) = next else { break };
                        match result {
                            Ok(message) => {
                                let context = context_of(&message);
                                let payload = message.payload().unwrap_or_default().to_vec();
                                let disposition = dispatch_message(
                                    &payload,
                                    context,
                                    dispatch.as_ref(),
                                    &registry,
                                    error_sink.as_deref(),
                                )
                                .await;

                                if disposition == Disposition::Commit {
                                    if let Err(e) =
                                        consumer.commit_message(&message, CommitMode::Async)
                                    {
                                        tracing::warn!(
                                            topic = message.topic(),
                                            partition = message.partition(),
                                            offset = message.offset(),
                                            error = %e,
                                            "Failed to commit offset (message may be redelivered)"
                                        );
                                    }
                                }
                            }
                            Err(e) => {
                                let error = BusError::TransportError(e.to_string());
                                report(error_sink.as_deref(), &error, None);
                            }
                        }
                    }
                }
            }

            tracing::debug!("Consumer loop exiting");
        });

        Ok(ConsumerHandle {
            shutdown: shutdown_tx,
            task,
        })
    }

    /// Verify broker reachability with bounded exponential backoff.
    async fn await_brokers(&self, consumer: &Arc<StreamConsumer>) -> Result<(), BusError> {
        let mut delay = Duration::from_millis(250);
        let mut last_error = String::new();

        for attempt in 1..=self.config.connect_attempts {
            let probe = Arc::clone(consumer);
            let result = tokio::task::spawn_blocking(move || {
                probe.fetch_metadata(None, Duration::from_secs(5))
            })
            .await;

            match result {
                Ok(Ok(_)) => return Ok(()),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(e) => last_error = format!("metadata probe panicked: {e}"),
            }

            tracing::warn!(
                attempt = attempt,
                max_attempts = self.config.connect_attempts,
                delay = ?delay,
                error = %last_error,
                "Broker not reachable, retrying"
            );
            tokio::time::sleep(delay).await;
            delay = (delay * 2).min(Duration::from_secs(8));
        }

        Err(BusError::ConnectionFailed(format!(
            "Brokers unreachable after {} attempts: {last_error}",
            self.config.connect_attempts
        )))
    }
}

fn context_of(message: &rdkafka::message::BorrowedMessage<'_>) -> MessageContext {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .filter_map(|header| {
                    header
                        .value
                        .map(|v| (header.key.to_string(), String::from_utf8_lossy(v).into_owned()))
                })
                .collect()
        })
        .unwrap_or_default();

    MessageContext {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        key: message
            .key()
            .map(|k| String::from_utf8_lossy(k).into_owned()),
        headers,
    }
}

fn report(sink: Option<&dyn ErrorSink>, error: &BusError, context: Option<&MessageContext>) {
    metrics::counter!("bus.consume_errors").increment(1);
    if let Some(sink) = sink {
        if let Err(sink_error) = sink.on_error(error, context) {
            tracing::warn!(error = %sink_error, "Error sink failed; swallowing");
        }
    } else {
        tracing::error!(error = %error, "Unhandled consumer error");
    }
}

async fn dispatch_message(
    payload: &[u8],
    context: MessageContext,
    dispatch: Option<&Dispatch>,
    registry: &SchemaRegistry,
    sink: Option<&dyn ErrorSink>,
) -> Disposition {
    let value: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(value) => value,
        Err(e) => {
            // Poison message: report and step over it.
            let error = BusError::DeserializationFailed(e.to_string());
            report(sink, &error, Some(&context));
            return Disposition::Commit;
        }
    };

    match dispatch {
        Some(Dispatch::Raw(handler)) => match handler.handle(value, context.clone()).await {
            Ok(()) => {
                metrics::counter!("bus.messages_consumed").increment(1);
                Disposition::Commit
            }
            Err(e) => {
                let error = BusError::TransportError(format!("handler failed: {e}"));
                report(sink, &error, Some(&context));
                Disposition::Hold
            }
        },
        Some(Dispatch::Event(handler)) => {
            let event: Event = match serde_json::from_value(value) {
                Ok(event) => event,
                Err(e) => {
                    let error = BusError::DeserializationFailed(format!("not an event: {e}"));
                    report(sink, &error, Some(&context));
                    return Disposition::Commit;
                }
            };

            let outcome = registry.validate(&event);
            if !outcome.valid {
                let error = BusError::InvalidEvent {
                    event_type: event.event_type.clone(),
                    reason: outcome.errors.join("; "),
                };
                report(sink, &error, Some(&context));
                return Disposition::Commit;
            }
            let event = outcome.migrated_event.unwrap_or(event);

            match handler.handle(event, context.clone()).await {
                Ok(()) => {
                    metrics::counter!("bus.events_consumed").increment(1);
                    Disposition::Commit
                }
                Err(e) => {
                    let error = BusError::TransportError(format!("handler failed: {e}"));
                    report(sink, &error, Some(&context));
                    Disposition::Hold
                }
            }
        }
        None => {
            tracing::warn!(topic = %context.topic, "Message received with no handler registered");
            Disposition::Commit
        }
    }
}
