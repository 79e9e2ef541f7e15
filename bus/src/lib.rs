//! Kafka-compatible event bus I/O for ProofPulse.
//!
//! This crate carries events between pipeline stages over a durable,
//! partitioned log. It provides:
//!
//! - [`producer::EventProducer`] - schema-validating publisher with topic
//!   derivation, header propagation, and per-topic batch grouping.
//! - [`consumer::EventConsumer`] - consumer-group reader with manual
//!   offset commits for at-least-once delivery and isolated handler errors.
//!
//! # Delivery semantics
//!
//! **At-least-once**: offsets are committed only after a handler returns
//! without error. A crash between handling and commit redelivers the
//! message, so downstream consumers must tolerate duplicates (correlate on
//! event id). Ordering is guaranteed within a partition; events partition
//! by organization id so one tenant's events stay ordered.
//!
//! # Data flow
//!
//! ```text
//! Webhook ──produce_event──> topic (order-events, user-events, …)
//!                               │
//!                     consumer group "materializer"
//!                               │
//!                        validate + migrate
//!                               │
//!                        EventHandler::handle
//!                               │  Ok        Err
//!                           commit ✓      hold + report
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod consumer;
pub mod error;
pub mod producer;

pub use consumer::{
    ConsumerConfig, ConsumerHandle, ErrorSink, EventConsumer, EventHandler, MessageContext,
    RawMessageHandler,
};
pub use error::{BusError, HandlerError};
pub use producer::{BatchReport, EventProducer, ProduceOptions};
