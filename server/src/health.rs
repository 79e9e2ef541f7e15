//! Health endpoints.
//!
//! `GET /health` is a bare liveness probe. `GET /health/detailed` checks
//! each backing component and aggregates: every component up → 200, some
//! down → 207 (degraded), all down → 503.

use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use std::collections::BTreeMap;

/// One component's probe outcome.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentHealth {
    /// `healthy` or `unhealthy`.
    pub status: &'static str,
    /// Diagnostic, present on failures.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ComponentHealth {
    /// A healthy component.
    #[must_use]
    pub const fn healthy() -> Self {
        Self {
            status: "healthy",
            details: None,
        }
    }

    /// A failed component with its diagnostic.
    #[must_use]
    pub const fn unhealthy(details: String) -> Self {
        Self {
            status: "unhealthy",
            details: Some(details),
        }
    }
}

/// Aggregate health levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    /// Every component up.
    Healthy,
    /// Some components down.
    Degraded,
    /// Every component down.
    Unhealthy,
}

/// Detailed health payload.
#[derive(Debug, Clone, Serialize)]
pub struct DetailedHealth {
    /// Aggregate level.
    pub status: HealthLevel,
    /// Service name.
    pub service: String,
    /// Per-component outcomes, stable order.
    pub components: BTreeMap<&'static str, ComponentHealth>,
}

/// Fold component outcomes into the aggregate level and HTTP status.
#[must_use]
pub fn aggregate(components: &BTreeMap<&'static str, ComponentHealth>) -> (HealthLevel, StatusCode) {
    let total = components.len();
    let down = components
        .values()
        .filter(|component| component.status != "healthy")
        .count();

    match down {
        0 => (HealthLevel::Healthy, StatusCode::OK),
        _ if down == total => (HealthLevel::Unhealthy, StatusCode::SERVICE_UNAVAILABLE),
        _ => (HealthLevel::Degraded, StatusCode::MULTI_STATUS),
    }
}

/// Basic liveness payload.
#[derive(Debug, Serialize)]
pub struct BasicHealth {
    /// Always `healthy` when the process answers.
    pub status: &'static str,
    /// Service name.
    pub service: String,
}

/// `GET /health`.
#[must_use]
pub fn basic(service: &str) -> (StatusCode, Json<BasicHealth>) {
    (
        StatusCode::OK,
        Json(BasicHealth {
            status: "healthy",
            service: service.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn components(states: &[(&'static str, bool)]) -> BTreeMap<&'static str, ComponentHealth> {
        states
            .iter()
            .map(|(name, up)| {
                let health = if *up {
                    ComponentHealth::healthy()
                } else {
                    ComponentHealth::unhealthy("down".to_string())
                };
                (*name, health)
            })
            .collect()
    }

    #[test]
    fn all_up_is_healthy_200() {
        let (level, status) = aggregate(&components(&[("store", true), ("queue", true)]));
        assert_eq!(level, HealthLevel::Healthy);
        assert_eq!(status, StatusCode::OK);
    }

    #[test]
    fn partial_outage_is_degraded_207() {
        let (level, status) = aggregate(&components(&[("store", false), ("queue", true)]));
        assert_eq!(level, HealthLevel::Degraded);
        assert_eq!(status, StatusCode::MULTI_STATUS);
    }

    #[test]
    fn total_outage_is_unhealthy_503() {
        let (level, status) = aggregate(&components(&[("store", false), ("queue", false)]));
        assert_eq!(level, HealthLevel::Unhealthy);
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
