//! Pre-registration bus for metric declarations.
//!
//! Modules declare their metric schemas from the composition root, before
//! telemetry is initialized. Initialization drains the bag and pre-creates
//! every instrument, so the emission hot path never pays first-use creation,
//! and the declared kind — not the name heuristic — decides how a value is
//! recorded.

use std::collections::HashMap;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Instrument kind for a declared metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    UpDownCounter,
    Histogram,
    ObservableGauge,
}

/// Schema for one metric: the authoritative kind plus descriptive metadata.
#[derive(Debug, Clone)]
pub struct MetricDefinition {
    /// Metric name, unique within the declaring module
    pub name: String,
    pub kind: MetricKind,
    pub description: String,
    /// Unit in UCUM notation ("ms", "By", ...), empty when dimensionless
    pub unit: String,
    /// Label keys this metric is expected to carry
    pub labels: Vec<String>,
    /// Explicit histogram bucket boundaries, when the SDK defaults don't fit
    pub buckets: Option<Vec<f64>>,
}

impl MetricDefinition {
    pub fn counter(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Counter, description)
    }

    pub fn up_down_counter(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, MetricKind::UpDownCounter, description)
    }

    pub fn histogram(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, MetricKind::Histogram, description)
    }

    pub fn observable_gauge(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self::new(name, MetricKind::ObservableGauge, description)
    }

    fn new(name: impl Into<String>, kind: MetricKind, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind,
            description: description.into(),
            unit: String::new(),
            labels: Vec::new(),
            buckets: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn with_labels(mut self, labels: &[&str]) -> Self {
        self.labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn with_buckets(mut self, buckets: Vec<f64>) -> Self {
        self.buckets = Some(buckets);
        self
    }
}

static DECLARED: Lazy<Mutex<HashMap<String, Vec<MetricDefinition>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Deposit metric declarations for a module. Later declarations for the same
/// module append; duplicate names within a module keep the first definition.
pub fn declare_metrics(module: &str, definitions: Vec<MetricDefinition>) {
    let mut bag = DECLARED.lock().unwrap_or_else(|e| e.into_inner());
    let entry = bag.entry(module.to_string()).or_default();
    for definition in definitions {
        if !entry.iter().any(|existing| existing.name == definition.name) {
            entry.push(definition);
        }
    }
}

/// Snapshot every declaration, flattened across modules. Called once during
/// registry initialization; the bag is left intact so diagnostics can list
/// declarations after the fact.
pub fn drain_declarations() -> Vec<MetricDefinition> {
    let bag = DECLARED.lock().unwrap_or_else(|e| e.into_inner());
    bag.values().flatten().cloned().collect()
}

/// Look up the declared kind for a metric name, across all modules
pub fn declared_kind(name: &str) -> Option<MetricKind> {
    let bag = DECLARED.lock().unwrap_or_else(|e| e.into_inner());
    bag.values()
        .flatten()
        .find(|definition| definition.name == name)
        .map(|definition| definition.kind)
}

#[cfg(test)]
pub(crate) fn clear_declarations() {
    DECLARED
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .clear();
}

/// Serializes tests that mutate the process-wide declaration table.
#[cfg(test)]
pub(crate) static DECLARATIONS_TEST_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declare_and_look_up() {
        let _guard = DECLARATIONS_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        clear_declarations();
        declare_metrics(
            "orchestrator",
            vec![
                MetricDefinition::counter("gomind.orchestrator.requests", "Requests processed")
                    .with_labels(&["status"]),
                MetricDefinition::histogram("gomind.orchestrator.latency", "Request latency")
                    .with_unit("ms")
                    .with_buckets(vec![10.0, 50.0, 250.0, 1000.0]),
            ],
        );

        assert_eq!(
            declared_kind("gomind.orchestrator.requests"),
            Some(MetricKind::Counter)
        );
        assert_eq!(
            declared_kind("gomind.orchestrator.latency"),
            Some(MetricKind::Histogram)
        );
        assert_eq!(declared_kind("gomind.unknown"), None);
        clear_declarations();
    }

    #[test]
    fn test_duplicate_names_keep_first_definition() {
        let _guard = DECLARATIONS_TEST_LOCK
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        clear_declarations();
        declare_metrics(
            "executor",
            vec![MetricDefinition::counter("gomind.executor.steps", "first")],
        );
        declare_metrics(
            "executor",
            vec![MetricDefinition::histogram("gomind.executor.steps", "second")],
        );
        assert_eq!(
            declared_kind("gomind.executor.steps"),
            Some(MetricKind::Counter)
        );
        assert_eq!(drain_declarations().len(), 1);
        clear_declarations();
    }
}
