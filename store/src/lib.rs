//! Event store and replay for ProofPulse.
//!
//! The durable record of every canonical event that flowed through the
//! pipeline, and the machinery to re-emit historical ranges:
//!
//! - [`PostgresEventStore`] - the production log (append-only, idempotent
//!   on event id, indexed by id/type/organization/timestamp).
//! - [`InMemoryEventStore`] - the same contract for tests and single-node
//!   development.
//! - [`ReplayEngine`] - filtered, stoppable replays with validation,
//!   forward migration, and progress reporting.
//!
//! Schema migrations ship under `migrations/` and run via
//! [`PostgresEventStore::migrate`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event_store;
pub mod memory;
pub mod replay;

pub use error::StoreError;
pub use event_store::{
    archive_before, stream_events, ArchiveSink, EventFilter, EventStore, PostgresEventStore,
    QueryResult, SortOrder, StoreStats,
};
pub use memory::InMemoryEventStore;
pub use replay::{ReplayConfig, ReplayEngine, ReplayProgress, ReplaySink, ReplaySummary};
