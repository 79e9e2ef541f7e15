//! Real-time delivery broker for ProofPulse.
//!
//! Fans rendered notifications out to browser widgets over WebSocket and
//! SSE, addressed by tenant:
//!
//! ```text
//! Delivery worker ─publish─> notifications:<siteId> ──┐
//!                                                     │ (pub/sub bridge)
//!   Browser ── GET /ws ─────────┐                     ▼
//!   Browser ── GET /api/…/sse ──┤──> Broker ──> ConnectionRegistry
//!                               │       │    (single lock, per-conn writer)
//!                        JWT auth       └─ heartbeats, backpressure,
//!                        channel authz     channel bridges
//! ```
//!
//! Connections live on a strict one-way state machine (`CONNECTING →
//! OPEN → CLOSING → CLOSED`); subscriptions are prefix-authorized against
//! the authenticated identity; a slow client sheds frames rather than
//! blocking its siblings.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod auth;
pub mod broker;
pub mod channel;
pub mod error;
pub mod frame;
pub mod handlers;
pub mod registry;

pub use auth::{AuthConfig, AuthVerifier, Identity};
pub use broker::{Broker, BrokerConfig, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION};
pub use error::BrokerError;
pub use frame::{ClientFrame, Outbound, ServerFrame};
pub use handlers::router;
pub use registry::{BroadcastStats, ConnectionRegistry, ConnectionState, Transport};
