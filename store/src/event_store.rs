//! The event store contract and its PostgreSQL implementation.
//!
//! The store is an append-only log of canonical events with query access
//! by id, correlation id, tenant, type, and time range. Events are
//! immutable once stored; storing the same id twice is an idempotent
//! no-op, which keeps the at-least-once pipeline safe to retry.

use crate::error::StoreError;
use chrono::{DateTime, Utc};
use futures::Stream;
use proofpulse_core::Event;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, QueryBuilder, Row};
use std::collections::HashMap;

/// Sort order for queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    /// Oldest first (replay order).
    #[default]
    Ascending,
    /// Newest first (dashboards).
    Descending,
}

/// Query filter over the event log.
#[derive(Debug, Clone)]
pub struct EventFilter {
    /// Match any of these event types.
    pub event_types: Option<Vec<String>>,
    /// Owning organization.
    pub organization_id: Option<String>,
    /// Owning site.
    pub site_id: Option<String>,
    /// Concerned user.
    pub user_id: Option<String>,
    /// Browser session.
    pub session_id: Option<String>,
    /// Correlation group.
    pub correlation_id: Option<String>,
    /// Inclusive lower bound on the event timestamp.
    pub from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on the event timestamp.
    pub to: Option<DateTime<Utc>>,
    /// Page size.
    pub limit: usize,
    /// Page offset.
    pub offset: usize,
    /// Sort order.
    pub sort: SortOrder,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            event_types: None,
            organization_id: None,
            site_id: None,
            user_id: None,
            session_id: None,
            correlation_id: None,
            from: None,
            to: None,
            limit: 100,
            offset: 0,
            sort: SortOrder::default(),
        }
    }
}

impl EventFilter {
    /// Whether an event satisfies every set predicate (ignores paging).
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(types) = &self.event_types {
            if !types.contains(&event.event_type) {
                return false;
            }
        }
        if let Some(org) = &self.organization_id {
            if &event.organization_id != org {
                return false;
            }
        }
        if let Some(site) = &self.site_id {
            if event.site_id.as_ref() != Some(site) {
                return false;
            }
        }
        if let Some(user) = &self.user_id {
            if event.user_id.as_ref() != Some(user) {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if event.session_id.as_ref() != Some(session) {
                return false;
            }
        }
        if let Some(correlation) = &self.correlation_id {
            if event.correlation_id.as_ref() != Some(correlation) {
                return false;
            }
        }
        if let Some(from) = self.from {
            if event.timestamp < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if event.timestamp >= to {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// The page of events.
    pub events: Vec<Event>,
    /// Total matches across all pages.
    pub total_count: u64,
    /// Whether more pages exist.
    pub has_more: bool,
    /// Offset of the next page, when one exists.
    pub next_offset: Option<usize>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    /// Total stored events.
    pub total_events: u64,
    /// Counts per event type.
    pub events_by_type: HashMap<String, u64>,
    /// Oldest stored event time.
    pub oldest: Option<DateTime<Utc>>,
    /// Newest stored event time.
    pub newest: Option<DateTime<Utc>>,
}

/// Storage contract for the event log.
pub trait EventStore: Send + Sync {
    /// Store one event (idempotent on id).
    fn store(
        &self,
        event: &Event,
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;

    /// Store a batch; returns how many were newly stored.
    fn store_batch(
        &self,
        events: &[Event],
    ) -> impl std::future::Future<Output = Result<usize, StoreError>> + Send;

    /// Fetch by id.
    fn find_by_id(
        &self,
        id: &str,
    ) -> impl std::future::Future<Output = Result<Option<Event>, StoreError>> + Send;

    /// Fetch every event in a correlation group, oldest first.
    fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Event>, StoreError>> + Send;

    /// Run a filtered, paged query.
    fn query(
        &self,
        filter: &EventFilter,
    ) -> impl std::future::Future<Output = Result<QueryResult, StoreError>> + Send;

    /// Delete events older than the cutoff; returns rows removed.
    fn delete_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<u64, StoreError>> + Send;

    /// Aggregate statistics.
    fn stats(&self) -> impl std::future::Future<Output = Result<StoreStats, StoreError>> + Send;

    /// Cheap connectivity probe.
    fn health_check(&self) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

/// Optional cold-storage sink for archival.
pub trait ArchiveSink: Send + Sync {
    /// Persist a batch of events to cold storage.
    fn archive(
        &self,
        events: &[Event],
    ) -> impl std::future::Future<Output = Result<(), StoreError>> + Send;
}

/// Stream a filtered range page by page, oldest first.
pub fn stream_events<S: EventStore>(
    store: &S,
    mut filter: EventFilter,
) -> impl Stream<Item = Result<Event, StoreError>> + Send + '_ {
    filter.sort = SortOrder::Ascending;
    async_stream::try_stream! {
        loop {
            let page = store.query(&filter).await?;
            let has_more = page.has_more;
            let next_offset = page.next_offset;
            for event in page.events {
                yield event;
            }
            match (has_more, next_offset) {
                (true, Some(offset)) => filter.offset = offset,
                _ => break,
            }
        }
    }
}

/// Archive everything older than `cutoff` into the sink, then delete it.
///
/// The sink write lands before the delete, so a crash in between leaves
/// duplicates in cold storage rather than a gap.
///
/// # Errors
///
/// Returns the first store or sink error; nothing is deleted unless its
/// batch archived successfully.
pub async fn archive_before<S: EventStore, A: ArchiveSink>(
    store: &S,
    sink: &A,
    cutoff: DateTime<Utc>,
) -> Result<u64, StoreError> {
    let mut filter = EventFilter {
        to: Some(cutoff),
        limit: 500,
        ..EventFilter::default()
    };

    let mut archived: u64 = 0;
    loop {
        let page = store.query(&filter).await?;
        if page.events.is_empty() {
            break;
        }
        sink.archive(&page.events).await?;
        archived += page.events.len() as u64;
        match (page.has_more, page.next_offset) {
            (true, Some(offset)) => filter.offset = offset,
            _ => break,
        }
    }
    let deleted = store.delete_before(cutoff).await?;
    tracing::info!(archived = archived, deleted = deleted, "Archive pass complete");
    Ok(deleted)
}

/// PostgreSQL event store.
///
/// # Example
///
/// ```no_run
/// use proofpulse_store::PostgresEventStore;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = PostgresEventStore::connect("postgres://localhost/proofpulse").await?;
/// store.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Connect with a default pool.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Database(format!("Failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the embedded schema migrations.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] when a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))
    }

    fn row_to_event(row: &PgRow) -> Result<Event, StoreError> {
        Ok(Event {
            id: row
                .try_get("id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            event_type: row
                .try_get("event_type")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            version: row
                .try_get("version")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            timestamp: row
                .try_get("timestamp")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            source: row
                .try_get("source")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            organization_id: row
                .try_get("organization_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            site_id: row
                .try_get("site_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            user_id: row
                .try_get("user_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            session_id: row
                .try_get("session_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            correlation_id: row
                .try_get("correlation_id")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            metadata: row
                .try_get("metadata")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            data: row
                .try_get("data")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }

    fn push_filters(builder: &mut QueryBuilder<'_, sqlx::Postgres>, filter: &EventFilter) {
        if let Some(types) = &filter.event_types {
            builder.push(" AND event_type = ANY(");
            builder.push_bind(types.clone());
            builder.push(")");
        }
        if let Some(org) = &filter.organization_id {
            builder.push(" AND organization_id = ");
            builder.push_bind(org.clone());
        }
        if let Some(site) = &filter.site_id {
            builder.push(" AND site_id = ");
            builder.push_bind(site.clone());
        }
        if let Some(user) = &filter.user_id {
            builder.push(" AND user_id = ");
            builder.push_bind(user.clone());
        }
        if let Some(session) = &filter.session_id {
            builder.push(" AND session_id = ");
            builder.push_bind(session.clone());
        }
        if let Some(correlation) = &filter.correlation_id {
            builder.push(" AND correlation_id = ");
            builder.push_bind(correlation.clone());
        }
        if let Some(from) = filter.from {
            builder.push(" AND timestamp >= ");
            builder.push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND timestamp < ");
            builder.push_bind(to);
        }
    }

    async fn insert(&self, event: &Event) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"
            INSERT INTO events (
                id, event_type, version, timestamp, source, organization_id,
                site_id, user_id, session_id, correlation_id, metadata, data
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO NOTHING
            ",
        )
        .bind(&event.id)
        .bind(&event.event_type)
        .bind(&event.version)
        .bind(event.timestamp)
        .bind(&event.source)
        .bind(&event.organization_id)
        .bind(&event.site_id)
        .bind(&event.user_id)
        .bind(&event.session_id)
        .bind(&event.correlation_id)
        .bind(&event.metadata)
        .bind(&event.data)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

impl EventStore for PostgresEventStore {
    async fn store(&self, event: &Event) -> Result<(), StoreError> {
        let inserted = self.insert(event).await?;
        if inserted {
            metrics::counter!("store.events_stored").increment(1);
        } else {
            // At-least-once redelivery: the id is already on disk.
            tracing::debug!(event_id = %event.id, "Duplicate event ignored");
        }
        Ok(())
    }

    async fn store_batch(&self, events: &[Event]) -> Result<usize, StoreError> {
        let mut stored = 0;
        for event in events {
            if self.insert(event).await? {
                stored += 1;
            }
        }
        metrics::counter!("store.events_stored").increment(stored as u64);
        Ok(stored)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Event>, StoreError> {
        let row = sqlx::query("SELECT * FROM events WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        row.as_ref().map(Self::row_to_event).transpose()
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<Event>, StoreError> {
        let rows =
            sqlx::query("SELECT * FROM events WHERE correlation_id = $1 ORDER BY timestamp ASC")
                .bind(correlation_id)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StoreError::Database(e.to_string()))?;
        rows.iter().map(Self::row_to_event).collect()
    }

    async fn query(&self, filter: &EventFilter) -> Result<QueryResult, StoreError> {
        let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM events WHERE TRUE");
        Self::push_filters(&mut count_builder, filter);
        let total_count: i64 = count_builder
            .build_query_scalar()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let mut builder = QueryBuilder::new("SELECT * FROM events WHERE TRUE");
        Self::push_filters(&mut builder, filter);
        builder.push(match filter.sort {
            SortOrder::Ascending => " ORDER BY timestamp ASC",
            SortOrder::Descending => " ORDER BY timestamp DESC",
        });
        builder.push(" LIMIT ");
        builder.push_bind(filter.limit as i64);
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset as i64);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        let events: Vec<Event> = rows
            .iter()
            .map(Self::row_to_event)
            .collect::<Result<_, _>>()?;

        let total_count = u64::try_from(total_count).unwrap_or(0);
        let next = filter.offset + events.len();
        let has_more = (next as u64) < total_count;
        Ok(QueryResult {
            events,
            total_count,
            has_more,
            next_offset: has_more.then_some(next),
        })
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM events WHERE timestamp < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let totals = sqlx::query(
            "SELECT COUNT(*) AS total, MIN(timestamp) AS oldest, MAX(timestamp) AS newest FROM events",
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::Database(e.to_string()))?;

        let by_type = sqlx::query("SELECT event_type, COUNT(*) AS count FROM events GROUP BY event_type")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Database(e.to_string()))?;

        let total: i64 = totals
            .try_get("total")
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        let mut events_by_type = HashMap::new();
        for row in &by_type {
            let event_type: String = row
                .try_get("event_type")
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let count: i64 = row
                .try_get("count")
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            events_by_type.insert(event_type, u64::try_from(count).unwrap_or(0));
        }

        Ok(StoreStats {
            total_events: u64::try_from(total).unwrap_or(0),
            events_by_type,
            oldest: totals
                .try_get("oldest")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
            newest: totals
                .try_get("newest")
                .map_err(|e| StoreError::Serialization(e.to_string()))?,
        })
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(event_type: &str, org: &str) -> Event {
        Event::new(event_type, "1.0.0", "test", org, json!({}))
    }

    #[test]
    fn filter_matches_all_set_predicates() {
        let filter = EventFilter {
            event_types: Some(vec!["order.created".to_string()]),
            organization_id: Some("org-1".to_string()),
            ..EventFilter::default()
        };

        assert!(filter.matches(&event("order.created", "org-1")));
        assert!(!filter.matches(&event("order.created", "org-2")));
        assert!(!filter.matches(&event("user.registered", "org-1")));
    }

    #[test]
    fn empty_filter_matches_everything() {
        let filter = EventFilter::default();
        assert!(filter.matches(&event("anything.at_all", "org-9")));
    }

    #[test]
    fn time_bounds_are_half_open() {
        let mut probe = event("order.created", "org-1");
        let at = probe.timestamp;
        let filter = EventFilter {
            from: Some(at),
            to: Some(at),
            ..EventFilter::default()
        };
        // from is inclusive, to is exclusive: [at, at) is empty.
        assert!(!filter.matches(&probe));

        probe.timestamp = at + chrono::Duration::milliseconds(1);
        let filter = EventFilter {
            from: Some(at),
            to: Some(at + chrono::Duration::seconds(1)),
            ..EventFilter::default()
        };
        assert!(filter.matches(&probe));
    }
}
