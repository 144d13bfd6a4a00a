//! Process-wide observability runtime with safety under load.
//!
//! The telemetry core gives every other subsystem a zero-friction metric and
//! trace API while defending the process against the classic observability
//! failure modes: unbounded label cardinality, a down backend back-pressuring
//! the application, and error-log floods. It keeps working — as a silent
//! no-op — when it was never initialized and after it has been shut down.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use gomind::telemetry::{self, TelemetryConfig};
//! use gomind::telemetry::api;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     telemetry::init(TelemetryConfig::development("my-agent"))?;
//!
//!     api::counter("gomind.request.count", &[("capability", "chat")]);
//!
//!     telemetry::shutdown(std::time::Duration::from_secs(5)).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Safety properties
//!
//! - **Cardinality bounding** — per-label-key value budgets with `"other"`
//!   overflow rewriting ([`cardinality`])
//! - **Circuit breaking** — a 3-state breaker guards the export path and
//!   self-heals when the backend recovers ([`circuit`])
//! - **Rate-limited self-logging** — one ERROR line per second, not one per
//!   failed emission ([`logger`], [`ratelimit`])
//! - **Bounded baggage** — W3C limits enforced on write, deterministic
//!   key-sorted label merging ([`baggage`])

use std::collections::HashMap;

use crate::component::ComponentType;
use crate::telemetry::circuit::CircuitBreakerConfig;

pub mod api;
pub mod baggage;
pub mod cardinality;
pub mod circuit;
pub mod declared;
pub mod health;
pub mod instruments;
pub mod logger;
pub mod provider;
pub mod ratelimit;
pub mod registry;

pub use api::{emit_with_options, EmitOptions};
pub use baggage::{baggage_stats, get_baggage, with_baggage, BaggageStats};
pub use declared::{declare_metrics, MetricDefinition, MetricKind};
pub use health::{get_health, health_handler, TelemetryHealth};
pub use registry::{init, is_initialized, registry, shutdown, InternalMetrics};

/// Which exporter backs the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExporterKind {
    /// OTLP over HTTP/protobuf, the production wire format
    Otlp,
    /// Console span export for development
    Stdout,
    /// No export; instruments still work, nothing leaves the process
    None,
}

impl ExporterKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExporterKind::Otlp => "otlp",
            ExporterKind::Stdout => "stdout",
            ExporterKind::None => "none",
        }
    }
}

/// Telemetry plane configuration.
///
/// Start from a profile and adjust with the `with_*` chain:
///
/// ```rust
/// use gomind::telemetry::TelemetryConfig;
///
/// let config = TelemetryConfig::production("checkout-agent")
///     .with_endpoint("otel-collector.observability:4318")
///     .with_cardinality_limit_for("user_id", 50);
/// ```
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Master switch; a disabled config initializes to silent no-ops
    pub enabled: bool,
    /// Reported as `service.name`; must be non-empty when enabled
    pub service_name: String,
    /// Component flavor; inferred from the last-created component when unset
    pub service_type: Option<ComponentType>,
    /// OTLP endpoint, normalized on use (empty means localhost:4318)
    pub endpoint: String,
    /// Exporter selection
    pub provider: ExporterKind,
    /// Head-based trace sampling probability in [0, 1]
    pub sampling_rate: f64,
    /// Default per-key cardinality budget for the well-known high-risk keys
    pub cardinality_limit: usize,
    /// Per-key cardinality budgets, overriding the default
    pub cardinality_limits: HashMap<String, usize>,
    /// Export-path circuit breaker settings
    pub circuit_breaker: CircuitBreakerConfig,
    /// Scrub log field values with `pii_patterns` before output
    pub pii_redaction: bool,
    /// Regex patterns for PII redaction
    pub pii_patterns: Vec<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_name: "gomind-service".to_string(),
            service_type: None,
            endpoint: String::new(),
            provider: ExporterKind::Otlp,
            sampling_rate: 1.0,
            cardinality_limit: 100,
            cardinality_limits: HashMap::new(),
            circuit_breaker: CircuitBreakerConfig::default(),
            pii_redaction: false,
            pii_patterns: Vec::new(),
        }
    }
}

impl TelemetryConfig {
    /// Development profile: sample everything, no circuit breaker, generous
    /// cardinality budgets.
    pub fn development(service_name: impl Into<String>) -> Self {
        let mut config = Self {
            service_name: service_name.into(),
            sampling_rate: 1.0,
            cardinality_limit: 1000,
            ..Self::default()
        };
        config.circuit_breaker.enabled = false;
        config.apply_env_overrides();
        config
    }

    /// Staging profile: 10% sampling with the circuit breaker armed.
    pub fn staging(service_name: impl Into<String>) -> Self {
        let mut config = Self {
            service_name: service_name.into(),
            sampling_rate: 0.1,
            cardinality_limit: 500,
            ..Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// Production profile: 0.1% sampling, tight cardinality budgets, circuit
    /// breaker armed.
    pub fn production(service_name: impl Into<String>) -> Self {
        let mut config = Self {
            service_name: service_name.into(),
            sampling_rate: 0.001,
            cardinality_limit: 100,
            ..Self::default()
        };
        config
            .cardinality_limits
            .insert("user_id".to_string(), 100);
        config
            .cardinality_limits
            .insert("session_id".to_string(), 100);
        config.apply_env_overrides();
        config
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_service_type(mut self, service_type: ComponentType) -> Self {
        self.service_type = Some(service_type);
        self
    }

    pub fn with_provider(mut self, provider: ExporterKind) -> Self {
        self.provider = provider;
        self
    }

    pub fn with_sampling_rate(mut self, rate: f64) -> Self {
        self.sampling_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_cardinality_limit_for(mut self, key: impl Into<String>, limit: usize) -> Self {
        self.cardinality_limits.insert(key.into(), limit);
        self
    }

    pub fn with_pii_redaction(mut self, patterns: Vec<String>) -> Self {
        self.pii_redaction = true;
        self.pii_patterns = patterns;
        self
    }

    /// Environment variables override specific fields:
    /// `OTEL_EXPORTER_OTLP_ENDPOINT` and `GOMIND_SERVICE_TYPE`. Log level
    /// and format (`GOMIND_LOG_LEVEL`, `GOMIND_DEBUG`, `GOMIND_LOG_FORMAT`,
    /// `KUBERNETES_SERVICE_HOST`) are read by the logger itself.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(endpoint) = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
            if !endpoint.is_empty() {
                self.endpoint = endpoint;
            }
        }
        if self.service_type.is_none() {
            if let Ok(raw) = std::env::var("GOMIND_SERVICE_TYPE") {
                self.service_type = ComponentType::parse(&raw);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.provider, ExporterKind::Otlp);
        assert_eq!(config.sampling_rate, 1.0);
        assert!(config.circuit_breaker.enabled);
    }

    #[test]
    fn test_development_profile() {
        let config = TelemetryConfig::development("dev-agent");
        assert_eq!(config.service_name, "dev-agent");
        assert_eq!(config.sampling_rate, 1.0);
        assert!(!config.circuit_breaker.enabled);
    }

    #[test]
    fn test_staging_profile() {
        let config = TelemetryConfig::staging("staging-agent");
        assert_eq!(config.sampling_rate, 0.1);
        assert!(config.circuit_breaker.enabled);
    }

    #[test]
    fn test_production_profile() {
        let config = TelemetryConfig::production("prod-agent");
        assert_eq!(config.sampling_rate, 0.001);
        assert!(config.circuit_breaker.enabled);
        assert_eq!(config.cardinality_limits.get("user_id"), Some(&100));
    }

    #[test]
    fn test_builder_chain() {
        let config = TelemetryConfig::default()
            .with_endpoint("collector:4318")
            .with_provider(ExporterKind::Stdout)
            .with_sampling_rate(2.0)
            .with_cardinality_limit_for("tenant", 25);
        assert_eq!(config.endpoint, "collector:4318");
        assert_eq!(config.provider, ExporterKind::Stdout);
        assert_eq!(config.sampling_rate, 1.0);
        assert_eq!(config.cardinality_limits.get("tenant"), Some(&25));
    }
}
