//! In-memory event store for tests and single-node development.

use crate::error::StoreError;
use crate::event_store::{EventFilter, EventStore, QueryResult, SortOrder, StoreStats};
use chrono::{DateTime, Utc};
use proofpulse_core::Event;
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Process-local event store.
#[derive(Default)]
pub struct InMemoryEventStore {
    events: Mutex<Vec<Event>>,
}

impl InMemoryEventStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn with_events<T>(&self, f: impl FnOnce(&mut Vec<Event>) -> T) -> T {
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut events)
    }
}

impl EventStore for InMemoryEventStore {
    async fn store(&self, event: &Event) -> Result<(), StoreError> {
        self.with_events(|events| {
            if !events.iter().any(|existing| existing.id == event.id) {
                events.push(event.clone());
            }
        });
        Ok(())
    }

    async fn store_batch(&self, batch: &[Event]) -> Result<usize, StoreError> {
        self.with_events(|events| {
            let mut stored = 0;
            for event in batch {
                if !events.iter().any(|existing| existing.id == event.id) {
                    events.push(event.clone());
                    stored += 1;
                }
            }
            Ok(stored)
        })
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<Event>, StoreError> {
        Ok(self.with_events(|events| events.iter().find(|event| event.id == id).cloned()))
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: &str,
    ) -> Result<Vec<Event>, StoreError> {
        Ok(self.with_events(|events| {
            let mut matches: Vec<Event> = events
                .iter()
                .filter(|event| event.correlation_id.as_deref() == Some(correlation_id))
                .cloned()
                .collect();
            matches.sort_by_key(|event| event.timestamp);
            matches
        }))
    }

    async fn query(&self, filter: &EventFilter) -> Result<QueryResult, StoreError> {
        Ok(self.with_events(|events| {
            let mut matches: Vec<Event> = events
                .iter()
                .filter(|event| filter.matches(event))
                .cloned()
                .collect();
            match filter.sort {
                SortOrder::Ascending => matches.sort_by_key(|event| event.timestamp),
                SortOrder::Descending => {
                    matches.sort_by_key(|event| std::cmp::Reverse(event.timestamp));
                }
            }

            let total_count = matches.len() as u64;
            let page: Vec<Event> = matches
                .into_iter()
                .skip(filter.offset)
                .take(filter.limit)
                .collect();
            let next = filter.offset + page.len();
            let has_more = (next as u64) < total_count;
            QueryResult {
                events: page,
                total_count,
                has_more,
                next_offset: has_more.then_some(next),
            }
        }))
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(self.with_events(|events| {
            let before = events.len();
            events.retain(|event| event.timestamp >= cutoff);
            (before - events.len()) as u64
        }))
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        Ok(self.with_events(|events| {
            let mut events_by_type: HashMap<String, u64> = HashMap::new();
            for event in events.iter() {
                *events_by_type.entry(event.event_type.clone()).or_insert(0) += 1;
            }
            StoreStats {
                total_events: events.len() as u64,
                events_by_type,
                oldest: events.iter().map(|event| event.timestamp).min(),
                newest: events.iter().map(|event| event.timestamp).max(),
            }
        }))
    }

    async fn health_check(&self) -> Result<(), StoreError> {
        Ok(())
    }
}
