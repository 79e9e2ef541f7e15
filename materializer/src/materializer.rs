//! Event-to-notification orchestration.
//!
//! One canonical event fans out to every active template for its (site,
//! event type), each independently: rules can filter one template's
//! notification while a sibling delivers. Failures follow the lifecycle
//! DAG - a render or enqueue failure marks that notification `failed` and
//! never blocks the others.

use crate::abtest;
use crate::error::MaterializerError;
use crate::model::{Notification, NotificationStatus, Template};
use crate::render::Renderer;
use crate::rules::{FilterReason, RuleDecision, RuleEngine, RulePolicies};
use crate::store::TemplateStore;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use proofpulse_core::Event;
use proofpulse_queue::{FrequencyLimiter, PriorityQueue, QueueBackend, QueueItem};
use serde::Serialize;
use std::sync::Arc;

/// Bounded per-event template parallelism.
const TEMPLATE_PARALLELISM: usize = 4;

/// A non-fatal analytics record emitted per notification decision.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    /// Notification this record describes.
    pub notification_id: String,
    /// Owning site.
    pub site_id: String,
    /// Template involved (the variant, when A/B selected one).
    pub template_id: String,
    /// Source event type.
    pub event_type: String,
    /// Final status at record time.
    pub status: &'static str,
    /// Filter reason, when filtered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_reason: Option<FilterReason>,
    /// Record timestamp.
    pub at: DateTime<Utc>,
}

/// Sink for analytics records. Recording failures must stay internal to
/// the sink; the pipeline never depends on analytics succeeding.
pub trait AnalyticsSink: Send + Sync {
    /// Record one decision.
    fn record(&self, record: AnalyticsRecord);
}

/// Outcome of materializing one template for one event.
#[derive(Debug, Clone)]
pub struct DeliveryOutcome {
    /// The notification record, in its final materializer-side status.
    pub notification: Notification,
    /// Why it was filtered, when it was.
    pub filter_reason: Option<FilterReason>,
    /// Channels an item was enqueued on.
    pub enqueued_channels: Vec<String>,
}

/// The notification materializer.
///
/// ```text
/// Event ─> templates ─┬─> rules ──filtered──> status=filtered
///                     ├─> A/B variant pick
///                     ├─> render (+sanitize, timeout) ──err──> status=failed
///                     └─> enqueue per channel ──err──> status=failed
/// ```
pub struct Materializer<S, B: QueueBackend> {
    store: Arc<S>,
    rules: RuleEngine<S, B>,
    queue: PriorityQueue<B>,
    renderer: Arc<Renderer>,
    analytics: Option<Arc<dyn AnalyticsSink>>,
}

impl<S: TemplateStore, B: QueueBackend> Materializer<S, B> {
    /// Assemble a materializer.
    #[must_use]
    pub fn new(
        store: Arc<S>,
        queue_backend: Arc<B>,
        renderer: Arc<Renderer>,
        policies: RulePolicies,
    ) -> Self {
        Self {
            rules: RuleEngine::new(
                Arc::clone(&store),
                FrequencyLimiter::new(Arc::clone(&queue_backend)),
                policies,
            ),
            queue: PriorityQueue::new(queue_backend),
            store,
            renderer,
            analytics: None,
        }
    }

    /// Attach an analytics sink.
    #[must_use]
    pub fn with_analytics(mut self, sink: Arc<dyn AnalyticsSink>) -> Self {
        self.analytics = Some(sink);
        self
    }

    /// Materialize an event into notifications across its site's active
    /// templates.
    ///
    /// # Errors
    ///
    /// Returns [`MaterializerError::Store`] when the template lookup
    /// itself fails; per-template failures are folded into their
    /// [`DeliveryOutcome`] instead.
    pub async fn process_event(
        &self,
        event: &Event,
    ) -> Result<Vec<DeliveryOutcome>, MaterializerError> {
        let site_id = event.site_id.as_deref().unwrap_or(&event.organization_id);
        let templates = self
            .store
            .find_active_templates(site_id, &event.event_type)
            .await?;

        if templates.is_empty() {
            tracing::debug!(
                site_id = site_id,
                event_type = %event.event_type,
                "No active templates for event"
            );
            return Ok(Vec::new());
        }

        let outcomes = stream::iter(templates)
            .map(|template| self.process_template(template, event))
            .buffered(TEMPLATE_PARALLELISM)
            .collect::<Vec<_>>()
            .await;

        Ok(outcomes)
    }

    #[allow(clippy::too_many_lines)] // The lifecycle DAG is one linear story; splitting it obscures the ordering.
    async fn process_template(&self, template: Template, event: &Event) -> DeliveryOutcome {
        let mut notification = Notification::pending(&template);

        match self.rules.evaluate(&template, event).await {
            Ok(RuleDecision::Allow) => {}
            Ok(RuleDecision::Filter(reason)) => {
                // Transitioning out of pending cannot fail.
                let _ = notification.transition(NotificationStatus::Filtered);
                metrics::counter!("materializer.notifications_filtered").increment(1);
                tracing::debug!(
                    notification_id = %notification.id,
                    template_id = %template.id,
                    reason = ?reason,
                    "Notification filtered"
                );
                self.record(&notification, Some(reason));
                return DeliveryOutcome {
                    notification,
                    filter_reason: Some(reason),
                    enqueued_channels: Vec::new(),
                };
            }
            Err(e) => {
                // Fail-open: rule infrastructure trouble must not mute
                // the site.
                tracing::warn!(error = %e, "Rule evaluation errored; allowing delivery");
            }
        }

        let template = self.select_variant(template, event).await;
        notification.template_id = template.id.clone();
        notification.channels = template.channels.clone();

        let context = render_context(event);
        let content = match self.renderer.render(&template, &context).await {
            Ok(content) => content,
            Err(e) => {
                let _ = notification.transition(NotificationStatus::Failed);
                metrics::counter!("materializer.notifications_failed", "stage" => "render")
                    .increment(1);
                tracing::error!(
                    notification_id = %notification.id,
                    template_id = %template.id,
                    error = %e,
                    "Render failed"
                );
                self.record(&notification, None);
                return DeliveryOutcome {
                    notification,
                    filter_reason: None,
                    enqueued_channels: Vec::new(),
                };
            }
        };
        notification.content = Some(content.clone());

        let payload = serde_json::json!({
            "notificationId": notification.id,
            "siteId": notification.site_id,
            "eventType": notification.event_type,
            "content": content,
            "data": event.data,
        });

        let mut enqueued = Vec::with_capacity(template.channels.len());
        for channel in &template.channels {
            let item = QueueItem::new(
                &notification.id,
                &notification.site_id,
                channel,
                template.priority,
                payload.clone(),
            );
            match self.queue.enqueue(item).await {
                Ok(_) => enqueued.push(channel.clone()),
                Err(e) => {
                    // Rendered but not queued: failed, never delivered.
                    let _ = notification.transition(NotificationStatus::Failed);
                    metrics::counter!("materializer.notifications_failed", "stage" => "enqueue")
                        .increment(1);
                    tracing::error!(
                        notification_id = %notification.id,
                        channel = %channel,
                        error = %e,
                        "Enqueue failed"
                    );
                    self.record(&notification, None);
                    return DeliveryOutcome {
                        notification,
                        filter_reason: None,
                        enqueued_channels: enqueued,
                    };
                }
            }
        }

        // Every channel accepted the item: the notification reached its
        // terminal delivered state.
        let _ = notification.transition(NotificationStatus::Delivered);
        metrics::counter!("materializer.notifications_materialized").increment(1);
        self.record(&notification, None);
        DeliveryOutcome {
            notification,
            filter_reason: None,
            enqueued_channels: enqueued,
        }
    }

    /// Apply the first active A/B test, if its bucket selects the variant.
    ///
    /// Additional active tests on the same template are ignored - first
    /// test wins, a known limitation of the assignment model.
    async fn select_variant(&self, template: Template, event: &Event) -> Template {
        let tests = match self
            .store
            .active_ab_tests(&template.site_id, &template.id)
            .await
        {
            Ok(tests) => tests,
            Err(e) => {
                tracing::warn!(error = %e, "A/B test lookup failed; using control");
                return template;
            }
        };

        let Some(test) = tests.first() else {
            return template;
        };
        if !abtest::in_variant(abtest::stable_key(event), &test.id, test.traffic_split) {
            return template;
        }

        match self.store.find_template(&test.variant_template_id).await {
            Ok(Some(variant)) if variant.active => {
                tracing::debug!(
                    test_id = %test.id,
                    control = %template.id,
                    variant = %variant.id,
                    "A/B variant selected"
                );
                metrics::counter!("materializer.ab_variant_selected").increment(1);
                variant
            }
            Ok(_) => {
                tracing::warn!(
                    test_id = %test.id,
                    variant = %test.variant_template_id,
                    "A/B variant missing or inactive; using control"
                );
                template
            }
            Err(e) => {
                tracing::warn!(error = %e, "A/B variant lookup failed; using control");
                template
            }
        }
    }

    fn record(&self, notification: &Notification, filter_reason: Option<FilterReason>) {
        let Some(sink) = &self.analytics else { return };
        sink.record(AnalyticsRecord {
            notification_id: notification.id.clone(),
            site_id: notification.site_id.clone(),
            template_id: notification.template_id.clone(),
            event_type: notification.event_type.clone(),
            status: notification.status.as_str(),
            filter_reason,
            at: Utc::now(),
        });
    }
}

/// Build the render context: the event data at the root, plus an `event`
/// object for identity fields templates occasionally need.
fn render_context(event: &Event) -> serde_json::Value {
    let mut context = if event.data.is_object() {
        event.data.clone()
    } else {
        serde_json::json!({ "data": event.data })
    };
    context["event"] = serde_json::json!({
        "id": event.id,
        "type": event.event_type,
        "timestamp": event.timestamp,
        "source": event.source,
    });
    context
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::model::{AbTest, TargetingCondition, TargetingMode, TargetingOp, TargetingRules};
    use crate::render::RendererConfig;
    use crate::store::InMemoryTemplateStore;
    use proofpulse_queue::{InMemoryBackend, Priority};
    use serde_json::json;
    use std::sync::Mutex;

    struct Fixture {
        store: Arc<InMemoryTemplateStore>,
        backend: Arc<InMemoryBackend>,
        records: Arc<RecordingAnalytics>,
        materializer: Materializer<InMemoryTemplateStore, InMemoryBackend>,
    }

    #[derive(Default)]
    struct RecordingAnalytics(Mutex<Vec<AnalyticsRecord>>);

    impl AnalyticsSink for RecordingAnalytics {
        fn record(&self, record: AnalyticsRecord) {
            self.0.lock().unwrap().push(record);
        }
    }

    fn fixture() -> Fixture {
        let store = Arc::new(InMemoryTemplateStore::new());
        let backend = Arc::new(InMemoryBackend::new());
        let records = Arc::new(RecordingAnalytics::default());
        let materializer = Materializer::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            Arc::new(Renderer::new(RendererConfig::default())),
            RulePolicies::default(),
        )
        .with_analytics(records.clone());
        Fixture {
            store,
            backend,
            records,
            materializer,
        }
    }

    fn order_template(id: &str, html: &str) -> Template {
        Template {
            id: id.to_string(),
            site_id: "site-1".to_string(),
            event_type: "order.created".to_string(),
            channels: vec!["web".to_string()],
            html: html.to_string(),
            css: ".toast {}".to_string(),
            text_fallback: None,
            subject: None,
            targeting: TargetingRules::default(),
            ab_test_id: None,
            priority: Priority::Normal,
            active: true,
            updated_at: Utc::now(),
        }
    }

    fn order_event() -> Event {
        Event::new(
            "order.created",
            "1.0.0",
            "shopify",
            "org-1",
            json!({
                "orderId": "1001",
                "customerName": "Ana",
                "total": 49.99,
                "currency": "USD",
                "products": [{ "title": "Mug", "price": 49.99, "quantity": 1 }]
            }),
        )
        .with_site_id("site-1")
    }

    #[tokio::test]
    async fn event_with_no_templates_yields_nothing() {
        let fixture = fixture();
        let outcomes = fixture.materializer.process_event(&order_event()).await.unwrap();
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn materializes_render_and_enqueue() {
        let fixture = fixture();
        fixture.store.put_template(order_template(
            "tpl-1",
            "<div><strong>{{ customerName }}</strong> bought {{ products.0.title }}</div>",
        ));

        let outcomes = fixture.materializer.process_event(&order_event()).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let outcome = &outcomes[0];
        assert_eq!(outcome.notification.status, NotificationStatus::Delivered);
        assert_eq!(outcome.enqueued_channels, vec!["web"]);

        let content = outcome.notification.content.as_ref().unwrap();
        assert!(content.html.contains("Ana"));
        assert!(content.html.contains("Mug"));
        assert_eq!(content.text.as_deref(), Some("Ana bought Mug"));

        // The item is actually on the channel queue.
        let queue = PriorityQueue::new(Arc::clone(&fixture.backend));
        let items = queue.dequeue("web", 10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].payload["data"]["customerName"], "Ana");
        assert_eq!(items[0].payload["notificationId"], outcome.notification.id);
    }

    #[tokio::test]
    async fn multiple_active_templates_fire_independently() {
        let fixture = fixture();
        fixture.store.put_template(order_template("tpl-1", "<p>A {{ customerName }}</p>"));
        fixture.store.put_template(order_template("tpl-2", "<p>B {{ customerName }}</p>"));

        let outcomes = fixture.materializer.process_event(&order_event()).await.unwrap();
        assert_eq!(outcomes.len(), 2);

        let queue = PriorityQueue::new(Arc::clone(&fixture.backend));
        assert_eq!(queue.dequeue("web", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn targeting_rejection_filters_without_enqueueing() {
        let fixture = fixture();
        let mut template = order_template("tpl-1", "<p>{{ customerName }}</p>");
        template.targeting = TargetingRules {
            mode: TargetingMode::All,
            conditions: vec![TargetingCondition {
                field: "total".to_string(),
                op: TargetingOp::Gt,
                value: json!(1000),
            }],
        };
        fixture.store.put_template(template);

        let outcomes = fixture.materializer.process_event(&order_event()).await.unwrap();
        assert_eq!(outcomes[0].notification.status, NotificationStatus::Filtered);
        assert_eq!(outcomes[0].filter_reason, Some(FilterReason::Targeting));

        let queue = PriorityQueue::new(Arc::clone(&fixture.backend));
        assert!(queue.dequeue("web", 10).await.unwrap().is_empty());

        let records = fixture.records.0.lock().unwrap();
        assert_eq!(records[0].status, "filtered");
    }

    #[tokio::test]
    async fn render_failure_marks_failed() {
        let fixture = fixture();
        fixture
            .store
            .put_template(order_template("tpl-1", "<p>{{ nonexistent_field }}</p>"));

        let outcomes = fixture.materializer.process_event(&order_event()).await.unwrap();
        assert_eq!(outcomes[0].notification.status, NotificationStatus::Failed);
        assert!(outcomes[0].enqueued_channels.is_empty());

        let queue = PriorityQueue::new(Arc::clone(&fixture.backend));
        assert!(queue.dequeue("web", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enqueue_failure_marks_failed_after_render() {
        let fixture = fixture();
        let mut template = order_template("tpl-1", "<p>{{ customerName }}</p>");
        template.channels = vec![String::new()]; // invalid channel
        fixture.store.put_template(template);

        let outcomes = fixture.materializer.process_event(&order_event()).await.unwrap();
        let outcome = &outcomes[0];
        assert_eq!(outcome.notification.status, NotificationStatus::Failed);
        assert!(outcome.notification.content.is_some(), "render succeeded first");
        assert!(outcome.enqueued_channels.is_empty());
    }

    #[tokio::test]
    async fn ab_variant_replaces_control_at_full_split() {
        let fixture = fixture();
        fixture.store.put_template(order_template("control", "<p>control</p>"));
        fixture.store.put_template(order_template("variant", "<p>variant</p>"));
        fixture.store.put_ab_test(AbTest {
            id: "test-1".to_string(),
            site_id: "site-1".to_string(),
            template_id: "control".to_string(),
            variant_template_id: "variant".to_string(),
            traffic_split: 100,
            active: true,
        });

        let event = order_event().with_user_id("u-1");
        let outcomes = fixture.materializer.process_event(&event).await.unwrap();

        // Both registered templates are active for the event type, so two
        // outcomes fire; with a 100% split neither renders the control.
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.notification.template_id == "variant"));
        assert!(outcomes.iter().all(|o| o
            .notification
            .content
            .as_ref()
            .unwrap()
            .html
            .contains("variant")));
    }

    #[tokio::test]
    async fn zero_split_keeps_control() {
        let fixture = fixture();
        fixture.store.put_template(order_template("control", "<p>control</p>"));
        let mut variant = order_template("variant", "<p>variant</p>");
        variant.active = false; // keep it out of the fan-out
        fixture.store.put_template(variant);
        fixture.store.put_ab_test(AbTest {
            id: "test-1".to_string(),
            site_id: "site-1".to_string(),
            template_id: "control".to_string(),
            variant_template_id: "variant".to_string(),
            traffic_split: 0,
            active: true,
        });

        let event = order_event().with_user_id("u-1");
        let outcomes = fixture.materializer.process_event(&event).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].notification.template_id, "control");
    }

    #[tokio::test]
    async fn analytics_records_every_decision() {
        let fixture = fixture();
        fixture.store.put_template(order_template("tpl-1", "<p>{{ customerName }}</p>"));

        fixture.materializer.process_event(&order_event()).await.unwrap();
        let records = fixture.records.0.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, "delivered");
        assert_eq!(records[0].event_type, "order.created");
    }
}
