//! Telemetry health snapshot and HTTP endpoint.
//!
//! Operators watch two things when the observability plane degrades: the
//! circuit-state log transitions and this endpoint. The JSON shape is stable
//! and the HTTP status encodes severity, so a plain Kubernetes probe can act
//! on it without parsing the body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use crate::telemetry::registry::registry;

/// Health snapshot of the telemetry plane
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryHealth {
    pub enabled: bool,
    pub provider: String,
    pub metrics_emitted: u64,
    pub metrics_dropped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub circuit_state: String,
    /// Seconds since initialization
    #[serde(rename = "uptime")]
    pub uptime_seconds: u64,
    pub cardinality_used: usize,
    pub cardinality_max: usize,
    pub initialized: bool,
}

impl TelemetryHealth {
    fn uninitialized() -> Self {
        Self {
            enabled: false,
            provider: "none".to_string(),
            metrics_emitted: 0,
            metrics_dropped: 0,
            errors: 0,
            last_error: None,
            circuit_state: "closed".to_string(),
            uptime_seconds: 0,
            cardinality_used: 0,
            cardinality_max: 0,
            initialized: false,
        }
    }

    /// HTTP status for this snapshot.
    ///
    /// 503 when the plane is absent, the circuit is open, or every emission
    /// errored; 206 when the error rate crosses 10%; 200 otherwise.
    pub fn status_code(&self) -> StatusCode {
        if !self.initialized {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        if self.circuit_state == "open" {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        if self.errors > 0 && self.metrics_emitted == 0 {
            return StatusCode::SERVICE_UNAVAILABLE;
        }
        let attempts = self.metrics_emitted + self.errors;
        if attempts > 0 && (self.errors as f64) / (attempts as f64) > 0.10 {
            return StatusCode::PARTIAL_CONTENT;
        }
        StatusCode::OK
    }
}

/// Current telemetry health. Always returns a snapshot, even before
/// initialization.
pub fn get_health() -> TelemetryHealth {
    let Some(registry) = registry() else {
        return TelemetryHealth::uninitialized();
    };

    let metrics = registry.internal_metrics();
    TelemetryHealth {
        enabled: registry.config().enabled,
        provider: registry.provider().exporter_kind().as_str().to_string(),
        metrics_emitted: metrics.metrics_emitted,
        metrics_dropped: metrics.metrics_dropped,
        errors: metrics.errors,
        last_error: metrics.last_error,
        circuit_state: registry.circuit_state().to_string(),
        uptime_seconds: metrics.uptime_seconds,
        cardinality_used: registry.cardinality_used(),
        cardinality_max: registry.cardinality_max(),
        initialized: true,
    }
}

/// Axum handler serving the health snapshot. Mount it wherever the service
/// exposes operational endpoints:
///
/// ```rust,no_run
/// use axum::{routing::get, Router};
///
/// let app: Router = Router::new()
///     .route("/telemetry/health", get(gomind::telemetry::health::health_handler));
/// ```
pub async fn health_handler() -> Response {
    let health = get_health();
    let status = health.status_code();
    (status, Json(health)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn healthy() -> TelemetryHealth {
        TelemetryHealth {
            enabled: true,
            provider: "otlp".to_string(),
            metrics_emitted: 1000,
            metrics_dropped: 0,
            errors: 0,
            last_error: None,
            circuit_state: "closed".to_string(),
            uptime_seconds: 3600,
            cardinality_used: 10,
            cardinality_max: 400,
            initialized: true,
        }
    }

    #[test]
    fn test_uninitialized_is_503() {
        let health = TelemetryHealth::uninitialized();
        assert_eq!(health.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_healthy_is_200() {
        assert_eq!(healthy().status_code(), StatusCode::OK);
    }

    #[test]
    fn test_open_circuit_is_503() {
        let health = TelemetryHealth {
            circuit_state: "open".to_string(),
            ..healthy()
        };
        assert_eq!(health.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_errors_with_zero_emissions_is_503() {
        let health = TelemetryHealth {
            metrics_emitted: 0,
            errors: 5,
            ..healthy()
        };
        assert_eq!(health.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_error_rate_over_ten_percent_is_206() {
        let health = TelemetryHealth {
            metrics_emitted: 80,
            errors: 20,
            ..healthy()
        };
        assert_eq!(health.status_code(), StatusCode::PARTIAL_CONTENT);
    }

    #[test]
    fn test_error_rate_under_ten_percent_is_200() {
        let health = TelemetryHealth {
            metrics_emitted: 99,
            errors: 1,
            ..healthy()
        };
        assert_eq!(health.status_code(), StatusCode::OK);
    }

    #[test]
    fn test_health_json_schema() {
        let value = serde_json::to_value(healthy()).unwrap();
        for field in [
            "enabled",
            "provider",
            "metrics_emitted",
            "metrics_dropped",
            "errors",
            "last_error",
            "circuit_state",
            "uptime",
            "cardinality_used",
            "cardinality_max",
            "initialized",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_get_health_without_registry() {
        // May run alongside registry tests; only assert the shape holds
        let health = get_health();
        assert!(health.uptime_seconds < u64::MAX);
    }
}
