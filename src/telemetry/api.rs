//! Zero-friction metric emission surface.
//!
//! Every function here is safe to call at any time: before initialization,
//! after shutdown, from any thread. When the registry slot is empty the call
//! is a silent no-op — an application instrumented with these helpers runs
//! identically with and without telemetry.
//!
//! ```rust
//! use gomind::telemetry::api;
//! use std::time::Instant;
//!
//! let started = Instant::now();
//! api::counter("gomind.request.count", &[("status", "ok")]);
//! api::duration("gomind.request.duration", started, &[]);
//! ```

use std::time::Instant;

use opentelemetry::Context;

use crate::telemetry::registry::{registry, InternalMetrics};

/// Increment a counter by one
pub fn counter(name: &str, labels: &[(&str, &str)]) {
    if let Some(registry) = registry() {
        registry.emit(None, name, 1.0, labels, true, None);
    }
}

/// Record a distribution sample
pub fn histogram(name: &str, value: f64, labels: &[(&str, &str)]) {
    if let Some(registry) = registry() {
        registry.emit(None, name, value, labels, true, None);
    }
}

/// Record a point-in-time value.
///
/// Routed through the histogram-as-gauge proxy; use
/// `MetricInstruments::register_gauge` for callback-driven gauges.
pub fn gauge(name: &str, value: f64, labels: &[(&str, &str)]) {
    if let Some(registry) = registry() {
        registry.emit(None, name, value, labels, true, None);
    }
}

/// Record the milliseconds elapsed since `start` as a histogram sample
pub fn duration(name: &str, start: Instant, labels: &[(&str, &str)]) {
    histogram(name, start.elapsed().as_secs_f64() * 1000.0, labels);
}

/// Count an error for a component, labeled by error type
pub fn record_error(component: &str, error_type: &str) {
    counter(
        "gomind.errors",
        &[("component", component), ("error_type", error_type)],
    );
}

/// Count a success for a component operation
pub fn record_success(component: &str, operation: &str) {
    counter(
        "gomind.success",
        &[("component", component), ("operation", operation)],
    );
}

/// Record an operation latency in milliseconds
pub fn record_latency(component: &str, operation: &str, millis: f64) {
    histogram(
        "gomind.latency",
        millis,
        &[("component", component), ("operation", operation)],
    );
}

/// Record a byte count (payload sizes, transfer volumes)
pub fn record_bytes(component: &str, direction: &str, bytes: u64) {
    histogram(
        "gomind.bytes",
        bytes as f64,
        &[("component", component), ("direction", direction)],
    );
}

/// Options for [`emit_with_options`]. Build with the `with_*` chain.
#[derive(Debug, Clone, Default)]
pub struct EmitOptions {
    pub labels: Vec<(String, String)>,
    pub unit: Option<String>,
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub sample_rate: Option<f64>,
    pub use_circuit: bool,
}

impl EmitOptions {
    pub fn new() -> Self {
        Self {
            use_circuit: true,
            ..Self::default()
        }
    }

    /// Attach an explicit observation timestamp.
    ///
    /// Carried for diagnostic log lines; the OTel SDK stamps exported data
    /// points at collection time.
    pub fn with_timestamp(mut self, timestamp: chrono::DateTime<chrono::Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Attach a unit hint ("ms", "By", ...)
    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }

    /// Append several labels
    pub fn with_labels(mut self, labels: &[(&str, &str)]) -> Self {
        self.labels
            .extend(labels.iter().map(|(k, v)| (k.to_string(), v.to_string())));
        self
    }

    /// Append one label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((key.into(), value.into()));
        self
    }

    /// Emit only this fraction of observations (head sampling)
    pub fn with_sample_rate(mut self, rate: f64) -> Self {
        self.sample_rate = Some(rate.clamp(0.0, 1.0));
        self
    }

    /// Bypass the export circuit breaker for this emission
    pub fn without_circuit_breaker(mut self) -> Self {
        self.use_circuit = false;
        self
    }
}

/// Emit a metric with baggage from `ctx` merged into its labels, honoring
/// the options' sampling and circuit settings.
pub fn emit_with_options(ctx: &Context, name: &str, value: f64, options: EmitOptions) {
    let Some(registry) = registry() else { return };
    let labels: Vec<(&str, &str)> = options
        .labels
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    registry.emit(
        Some(ctx),
        name,
        value,
        &labels,
        options.use_circuit,
        options.sample_rate,
    );
}

// Unified cross-module helpers. Components use these so the whole network
// shares one metric namespace.

/// Count an inbound request handled by a component capability
pub fn record_request(component: &str, capability: &str) {
    counter(
        "gomind.request.count",
        &[("component", component), ("capability", capability)],
    );
}

/// Count a failed inbound request
pub fn record_request_error(component: &str, capability: &str, error_type: &str) {
    counter(
        "gomind.request.errors",
        &[
            ("component", component),
            ("capability", capability),
            ("error_type", error_type),
        ],
    );
}

/// Count an outbound tool invocation
pub fn record_tool_call(tool: &str) {
    counter("gomind.toolcall.count", &[("tool", tool)]);
}

/// Count a failed outbound tool invocation
pub fn record_tool_call_error(tool: &str, error_type: &str) {
    counter(
        "gomind.toolcall.errors",
        &[("tool", tool), ("error_type", error_type)],
    );
}

/// Count a retried outbound tool invocation
pub fn record_tool_call_retry(tool: &str, attempt: u32) {
    counter(
        "gomind.toolcall.retries",
        &[("tool", tool), ("attempt", &attempt.to_string())],
    );
}

/// Count an LLM request, labeled by provider and model
pub fn record_ai_request(provider: &str, model: &str, status: &str) {
    counter(
        "gomind.ai.request.count",
        &[("provider", provider), ("model", model), ("status", status)],
    );
}

/// Record LLM token consumption
pub fn record_ai_tokens(provider: &str, model: &str, direction: &str, tokens: u64) {
    histogram(
        "gomind.ai.tokens",
        tokens as f64,
        &[
            ("provider", provider),
            ("model", model),
            ("direction", direction),
        ],
    );
}

/// Internal counters snapshot, when initialized
pub fn get_internal_metrics() -> Option<InternalMetrics> {
    registry().map(|registry| registry.internal_metrics())
}

/// Zero the internal counters (test harness hook)
pub fn reset_internal_metrics() {
    if let Some(registry) = registry() {
        registry.reset_internal_metrics();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_options_builder() {
        let options = EmitOptions::new()
            .with_unit("ms")
            .with_label("component", "executor")
            .with_labels(&[("status", "ok")])
            .with_sample_rate(0.5)
            .without_circuit_breaker();

        assert_eq!(options.unit.as_deref(), Some("ms"));
        assert_eq!(options.labels.len(), 2);
        assert_eq!(options.sample_rate, Some(0.5));
        assert!(!options.use_circuit);
    }

    #[test]
    fn test_sample_rate_clamped() {
        let options = EmitOptions::new().with_sample_rate(7.5);
        assert_eq!(options.sample_rate, Some(1.0));
        let options = EmitOptions::new().with_sample_rate(-1.0);
        assert_eq!(options.sample_rate, Some(0.0));
    }

    #[test]
    fn test_helpers_are_noops_when_uninitialized() {
        // Must not panic without a registry
        counter("gomind.test", &[]);
        histogram("gomind.test.duration", 1.0, &[]);
        gauge("gomind.test.size", 2.0, &[]);
        duration("gomind.test.elapsed", Instant::now(), &[]);
        record_error("api", "timeout");
        record_success("api", "emit");
        record_latency("api", "emit", 0.1);
        record_bytes("api", "out", 128);
        record_request("agent", "chat");
        record_request_error("agent", "chat", "timeout");
        record_tool_call("weather");
        record_tool_call_error("weather", "network");
        record_tool_call_retry("weather", 2);
        record_ai_request("openai", "gpt-4", "ok");
        record_ai_tokens("openai", "gpt-4", "input", 900);
        emit_with_options(
            &Context::new(),
            "gomind.test",
            1.0,
            EmitOptions::new(),
        );
    }
}
