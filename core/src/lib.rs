//! Core types for the ProofPulse notification pipeline.
//!
//! This crate owns the vocabulary the rest of the workspace speaks:
//!
//! - [`event`] - the canonical [`Event`](event::Event) every signal is
//!   normalized into, plus the deterministic topic-routing rule.
//! - [`schema`] - the semver'd [`SchemaRegistry`](schema::SchemaRegistry)
//!   that validates payloads and migrates old versions forward.
//! - [`payload`] - typed shapes for the commerce kinds the pipeline models.
//! - [`error`] - the [`ErrorKind`](error::ErrorKind) taxonomy shared by
//!   every component's error enums.
//!
//! Everything here is backend-free: no Kafka, Redis, or Postgres types leak
//! into this crate, which keeps the infrastructure crates swappable.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod event;
pub mod payload;
pub mod schema;

pub use error::ErrorKind;
pub use event::{topic_for, Event};
pub use payload::EventData;
pub use schema::{SchemaRegistry, Validation};
