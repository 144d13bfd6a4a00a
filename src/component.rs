//! Component identity and the telemetry integration shim.
//!
//! The core module knows about two component flavors: passive `tool`s and
//! active `agent`s. Telemetry wants to tag every exported series with the
//! flavor of the process it came from, but the telemetry module must not
//! depend on component construction. The coupling runs the other way: this
//! module exposes a narrow [`FrameworkMetrics`] interface that telemetry
//! installs on initialization and clears on shutdown, plus a
//! "last created component type" marker telemetry may read when the service
//! type was not configured explicitly.
//!
//! Ordering constraint: the marker records whatever component was constructed
//! most recently, so telemetry must be initialized *after* the component is
//! built to pick up the correct flavor. Prefer setting
//! `TelemetryConfig.service_type` explicitly; the marker is a convenience
//! default only.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use opentelemetry::Context;

/// Component flavor: tools are passive, agents discover and orchestrate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    Tool,
    Agent,
}

impl ComponentType {
    /// Parse from the string form used in configuration and environment
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_lowercase().as_str() {
            "tool" => Some(ComponentType::Tool),
            "agent" => Some(ComponentType::Agent),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Tool => "tool",
            ComponentType::Agent => "agent",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Narrow metrics interface the core module uses without depending on the
/// telemetry internals. Installed by telemetry initialization, cleared on
/// shutdown; all methods are no-ops while no implementation is installed.
pub trait FrameworkMetrics: Send + Sync {
    /// Increment a counter by one
    fn counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Emit a metric value, merging baggage carried by `ctx` into the labels
    fn emit_with_context(&self, ctx: &Context, name: &str, value: f64, labels: &[(&str, &str)]);

    /// Read the baggage map carried by `ctx`
    fn get_baggage(&self, ctx: &Context) -> HashMap<String, String>;
}

static FRAMEWORK_METRICS: Lazy<RwLock<Option<Arc<dyn FrameworkMetrics>>>> =
    Lazy::new(|| RwLock::new(None));

static LAST_COMPONENT_TYPE: Lazy<RwLock<Option<ComponentType>>> = Lazy::new(|| RwLock::new(None));

/// Install the framework metrics implementation. Called by telemetry
/// initialization; passing `None` (shutdown) restores no-op behavior.
pub fn set_framework_metrics(metrics: Option<Arc<dyn FrameworkMetrics>>) {
    if let Ok(mut slot) = FRAMEWORK_METRICS.write() {
        *slot = metrics;
    }
}

/// Current framework metrics implementation, if telemetry is initialized
pub fn framework_metrics() -> Option<Arc<dyn FrameworkMetrics>> {
    FRAMEWORK_METRICS.read().ok().and_then(|slot| slot.clone())
}

/// Record the flavor of the most recently constructed component
pub fn set_last_component_type(component_type: ComponentType) {
    if let Ok(mut slot) = LAST_COMPONENT_TYPE.write() {
        *slot = Some(component_type);
    }
}

/// Flavor of the most recently constructed component, if any
pub fn last_component_type() -> Option<ComponentType> {
    LAST_COMPONENT_TYPE.read().ok().and_then(|slot| *slot)
}

/// Identity of a component participating in the network.
///
/// Constructing a component records its flavor in the process-wide marker so
/// that telemetry initialized afterwards can infer the service type.
#[derive(Debug, Clone)]
pub struct Component {
    pub name: String,
    pub namespace: String,
    pub component_type: ComponentType,
}

impl Component {
    pub fn new(
        name: impl Into<String>,
        namespace: impl Into<String>,
        component_type: ComponentType,
    ) -> Self {
        set_last_component_type(component_type);
        Self {
            name: name.into(),
            namespace: namespace.into(),
            component_type,
        }
    }

    /// Canonical `name.namespace` identifier used in routing plans and
    /// orchestrator responses
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.name, self.namespace)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_component_type_parsing() {
        assert_eq!(ComponentType::parse("tool"), Some(ComponentType::Tool));
        assert_eq!(ComponentType::parse("AGENT"), Some(ComponentType::Agent));
        assert_eq!(ComponentType::parse("service"), None);
    }

    #[test]
    fn test_component_records_marker() {
        let component = Component::new("weather", "default", ComponentType::Agent);
        assert_eq!(component.qualified_name(), "weather.default");
        assert_eq!(last_component_type(), Some(ComponentType::Agent));

        Component::new("conversion", "default", ComponentType::Tool);
        assert_eq!(last_component_type(), Some(ComponentType::Tool));
    }

    #[test]
    fn test_framework_metrics_trait_object() {
        struct CountingMetrics(std::sync::atomic::AtomicU64);

        impl FrameworkMetrics for CountingMetrics {
            fn counter(&self, _name: &str, _labels: &[(&str, &str)]) {
                self.0.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            }
            fn emit_with_context(
                &self,
                _ctx: &Context,
                _name: &str,
                _value: f64,
                _labels: &[(&str, &str)],
            ) {
            }
            fn get_baggage(&self, _ctx: &Context) -> HashMap<String, String> {
                HashMap::new()
            }
        }

        let metrics: Arc<dyn FrameworkMetrics> = Arc::new(CountingMetrics(Default::default()));
        metrics.counter("gomind.request.count", &[("capability", "chat")]);
        assert!(metrics.get_baggage(&Context::new()).is_empty());
    }
}
