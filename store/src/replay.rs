//! Replay: re-emit historical event ranges into the pipeline.
//!
//! Backfills, bug recoveries, and new-consumer bootstraps all reduce to
//! the same operation: stream a filtered time range out of the store,
//! optionally re-validate and migrate each event, and publish it again -
//! to its derived topic or an override. Replays are stoppable mid-flight
//! and report progress at a configurable cadence.

use crate::error::StoreError;
use crate::event_store::{stream_events, EventFilter, EventStore, SortOrder};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use proofpulse_core::schema::SchemaRegistry;
use proofpulse_core::Event;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;

/// Replay configuration.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Inclusive start of the range.
    pub from: DateTime<Utc>,
    /// Exclusive end of the range.
    pub to: DateTime<Utc>,
    /// Only these event types, when set.
    pub event_types: Option<Vec<String>>,
    /// Only these organizations, when set.
    pub organization_ids: Option<Vec<String>>,
    /// Only these sites, when set.
    pub site_ids: Option<Vec<String>>,
    /// Publish to these topics instead of each event's derived topic.
    pub target_topics: Option<Vec<String>>,
    /// Re-validate (and migrate, when enabled) before publishing.
    pub validate: bool,
    /// Migrate old versions forward; implies validation of the result.
    pub migrate: bool,
    /// Emit progress every N processed events.
    pub progress_interval: usize,
    /// Store page size.
    pub batch_size: usize,
}

impl ReplayConfig {
    /// A replay over a time range with defaults for everything else.
    #[must_use]
    pub fn range(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from,
            to,
            event_types: None,
            organization_ids: None,
            site_ids: None,
            target_topics: None,
            validate: true,
            migrate: true,
            progress_interval: 100,
            batch_size: 200,
        }
    }

    fn accepts(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(orgs) = &self.organization_ids {
            if !orgs.contains(&event.organization_id) {
                return false;
            }
        }
        if let Some(sites) = &self.site_ids {
            let Some(site) = &event.site_id else {
                return false;
            };
            if !sites.contains(site) {
                return false;
            }
        }
        true
    }
}

/// Where replayed events go. The server adapts the bus producer; tests
/// record in memory.
pub trait ReplaySink: Send + Sync {
    /// Publish one event to a topic.
    fn publish(
        &self,
        event: &Event,
        topic: &str,
    ) -> impl std::future::Future<Output = Result<(), String>> + Send;
}

/// Point-in-time replay progress.
#[derive(Debug, Clone)]
pub struct ReplayProgress {
    /// Total events in range (store count).
    pub total: u64,
    /// Events examined so far.
    pub processed: u64,
    /// Events republished.
    pub successful: u64,
    /// Events skipped or failed (filtered out, invalid, publish error).
    pub failed: u64,
    /// The event currently in hand.
    pub current_event_id: Option<String>,
    /// When the replay started.
    pub started_at: DateTime<Utc>,
    /// Estimated seconds remaining, once measurable.
    pub eta_seconds: Option<u64>,
}

/// Final replay accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Events examined.
    pub processed: u64,
    /// Events republished.
    pub successful: u64,
    /// Events skipped or failed.
    pub failed: u64,
    /// Whether the replay was stopped before the range was exhausted.
    pub stopped: bool,
}

type ProgressFn = dyn Fn(ReplayProgress) + Send + Sync;

/// The replay engine.
pub struct ReplayEngine<S, K> {
    store: Arc<S>,
    sink: Arc<K>,
    registry: Arc<SchemaRegistry>,
    on_progress: Option<Box<ProgressFn>>,
}

impl<S: EventStore, K: ReplaySink> ReplayEngine<S, K> {
    /// Assemble an engine.
    #[must_use]
    pub fn new(store: Arc<S>, sink: Arc<K>, registry: Arc<SchemaRegistry>) -> Self {
        Self {
            store,
            sink,
            registry,
            on_progress: None,
        }
    }

    /// Install a progress callback.
    #[must_use]
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(ReplayProgress) + Send + Sync + 'static,
    {
        self.on_progress = Some(Box::new(callback));
        self
    }

    /// Run a replay until the range is exhausted or `stop` fires.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the store itself fails; per-event
    /// validation and publish failures are counted, not fatal.
    #[allow(clippy::too_many_lines)] // One pass, one loop; the accounting is the point.
    pub async fn run(
        &self,
        config: ReplayConfig,
        mut stop: watch::Receiver<bool>,
    ) -> Result<ReplaySummary, StoreError> {
        let filter = EventFilter {
            event_types: config.event_types.clone(),
            from: Some(config.from),
            to: Some(config.to),
            limit: config.batch_size,
            sort: SortOrder::Ascending,
            ..EventFilter::default()
        };

        let total = self.store.query(&filter).await?.total_count;
        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(total = total, from = %config.from, to = %config.to, "Replay starting");

        let mut processed: u64 = 0;
        let mut successful: u64 = 0;
        let mut failed: u64 = 0;
        let mut stopped = false;

        let mut stream = std::pin::pin!(stream_events(self.store.as_ref(), filter));
        while let Some(next) = stream.next().await {
            if *stop.borrow_and_update() {
                stopped = true;
                break;
            }

            let event = next?;
            processed += 1;

            if !config.accepts(&event) {
                continue;
            }

            let event = if config.validate || config.migrate {
                let outcome = self.registry.validate(&event);
                if !outcome.valid {
                    tracing::warn!(
                        event_id = %event.id,
                        errors = ?outcome.errors,
                        "Replay skipping invalid event"
                    );
                    failed += 1;
                    continue;
                }
                if config.migrate {
                    outcome.migrated_event.unwrap_or(event)
                } else {
                    event
                }
            } else {
                event
            };

            let published = match &config.target_topics {
                Some(topics) => {
                    let mut all_ok = true;
                    for topic in topics {
                        if let Err(e) = self.sink.publish(&event, topic).await {
                            tracing::error!(event_id = %event.id, topic = %topic, error = %e, "Replay publish failed");
                            all_ok = false;
                        }
                    }
                    all_ok
                }
                None => match self.sink.publish(&event, &event.topic()).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!(event_id = %event.id, error = %e, "Replay publish failed");
                        false
                    }
                },
            };
            if published {
                successful += 1;
                metrics::counter!("store.events_replayed").increment(1);
            } else {
                failed += 1;
            }

            if config.progress_interval > 0 && processed % config.progress_interval as u64 == 0 {
                self.report(ReplayProgress {
                    total,
                    processed,
                    successful,
                    failed,
                    current_event_id: Some(event.id.clone()),
                    started_at,
                    eta_seconds: eta(clock, processed, total),
                });
            }
        }

        let summary = ReplaySummary {
            processed,
            successful,
            failed,
            stopped,
        };
        tracing::info!(
            processed = summary.processed,
            successful = summary.successful,
            failed = summary.failed,
            stopped = summary.stopped,
            "Replay finished"
        );
        Ok(summary)
    }

    fn report(&self, progress: ReplayProgress) {
        tracing::info!(
            processed = progress.processed,
            total = progress.total,
            successful = progress.successful,
            failed = progress.failed,
            eta_seconds = progress.eta_seconds,
            "Replay progress"
        );
        if let Some(callback) = &self.on_progress {
            callback(progress);
        }
    }
}

fn eta(clock: Instant, processed: u64, total: u64) -> Option<u64> {
    if processed == 0 || total <= processed {
        return None;
    }
    let elapsed = clock.elapsed().as_secs_f64();
    let per_event = elapsed / processed as f64;
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    Some((per_event * (total - processed) as f64) as u64)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::memory::InMemoryEventStore;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink(Mutex<Vec<(String, Event)>>);

    impl ReplaySink for RecordingSink {
        async fn publish(&self, event: &Event, topic: &str) -> Result<(), String> {
            self.0
                .lock()
                .unwrap()
                .push((topic.to_string(), event.clone()));
            Ok(())
        }
    }

    fn order_event(org: &str) -> Event {
        Event::new(
            "order.created",
            "1.0.0",
            "test",
            org,
            json!({
                "orderId": "1",
                "total": 10.0,
                "currency": "USD",
                "products": []
            }),
        )
    }

    fn user_event() -> Event {
        Event::new(
            "user.registered",
            "1.0.0",
            "test",
            "org-1",
            json!({ "userId": "u-1", "email": "a@x.com" }),
        )
    }

    async fn engine_with(
        events: Vec<Event>,
    ) -> (
        ReplayEngine<InMemoryEventStore, RecordingSink>,
        Arc<RecordingSink>,
    ) {
        let store = Arc::new(InMemoryEventStore::new());
        for event in &events {
            store.store(event).await.unwrap();
        }
        let sink = Arc::new(RecordingSink::default());
        let engine = ReplayEngine::new(
            store,
            Arc::clone(&sink),
            Arc::new(SchemaRegistry::with_builtins()),
        );
        (engine, sink)
    }

    fn window() -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc::now() - chrono::Duration::hours(1),
            Utc::now() + chrono::Duration::hours(1),
        )
    }

    fn no_stop() -> watch::Receiver<bool> {
        // The engine only reads the flag, so a dropped sender is fine.
        watch::channel(false).1
    }

    #[tokio::test]
    async fn replays_the_full_range() {
        let (engine, sink) = engine_with(vec![order_event("org-1"), order_event("org-2")]).await;
        let (from, to) = window();

        let summary = engine
            .run(ReplayConfig::range(from, to), no_stop())
            .await
            .unwrap();

        assert_eq!(summary.processed, 2);
        assert_eq!(summary.successful, 2);
        assert!(!summary.stopped);
        let published = sink.0.lock().unwrap();
        assert!(published.iter().all(|(topic, _)| topic == "order-events"));
    }

    #[tokio::test]
    async fn filters_apply_before_publish() {
        let (engine, sink) = engine_with(vec![order_event("org-1"), order_event("org-2")]).await;
        let (from, to) = window();

        let config = ReplayConfig {
            organization_ids: Some(vec!["org-1".to_string()]),
            ..ReplayConfig::range(from, to)
        };
        let summary = engine.run(config, no_stop()).await.unwrap();

        assert_eq!(summary.successful, 1);
        assert_eq!(sink.0.lock().unwrap()[0].1.organization_id, "org-1");
    }

    #[tokio::test]
    async fn migration_applies_during_replay() {
        let (engine, sink) = engine_with(vec![user_event()]).await;
        let (from, to) = window();

        engine
            .run(ReplayConfig::range(from, to), no_stop())
            .await
            .unwrap();

        let published = sink.0.lock().unwrap();
        assert_eq!(published[0].1.version, "1.1.0");
        assert_eq!(published[0].1.data["timezone"], "UTC");
    }

    #[tokio::test]
    async fn target_topics_override_derivation() {
        let (engine, sink) = engine_with(vec![order_event("org-1")]).await;
        let (from, to) = window();

        let config = ReplayConfig {
            target_topics: Some(vec!["backfill-a".to_string(), "backfill-b".to_string()]),
            ..ReplayConfig::range(from, to)
        };
        engine.run(config, no_stop()).await.unwrap();

        let topics: Vec<String> = sink.0.lock().unwrap().iter().map(|(t, _)| t.clone()).collect();
        assert_eq!(topics, vec!["backfill-a", "backfill-b"]);
    }

    #[tokio::test]
    async fn stop_signal_halts_the_replay() {
        let (engine, sink) = engine_with(vec![order_event("org-1"), order_event("org-1")]).await;
        let (from, to) = window();

        let (tx, rx) = watch::channel(true);
        let summary = engine
            .run(ReplayConfig::range(from, to), rx)
            .await
            .unwrap();
        drop(tx);

        assert!(summary.stopped);
        assert!(sink.0.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn empty_filter_equals_union_of_per_type_filters() {
        let events = vec![order_event("org-1"), user_event()];
        let (from, to) = window();

        let (all_engine, all_sink) = engine_with(events.clone()).await;
        all_engine
            .run(ReplayConfig::range(from, to), no_stop())
            .await
            .unwrap();

        let (split_engine, split_sink) = engine_with(events).await;
        for event_type in ["order.created", "user.registered"] {
            let config = ReplayConfig {
                event_types: Some(vec![event_type.to_string()]),
                ..ReplayConfig::range(from, to)
            };
            split_engine.run(config, no_stop()).await.unwrap();
        }

        let mut all_ids: Vec<String> =
            all_sink.0.lock().unwrap().iter().map(|(_, e)| e.id.clone()).collect();
        let mut split_ids: Vec<String> =
            split_sink.0.lock().unwrap().iter().map(|(_, e)| e.id.clone()).collect();
        all_ids.sort();
        split_ids.sort();
        assert_eq!(all_ids, split_ids);
    }

    #[tokio::test]
    async fn invalid_events_are_counted_not_fatal() {
        let broken = Event::new("order.created", "1.0.0", "test", "org-1", json!({}));
        let (engine, sink) = engine_with(vec![broken, order_event("org-1")]).await;
        let (from, to) = window();

        let summary = engine
            .run(ReplayConfig::range(from, to), no_stop())
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(sink.0.lock().unwrap().len(), 1);
    }
}
