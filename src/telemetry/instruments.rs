//! Lazy, deduplicated OpenTelemetry instrument management.
//!
//! Instruments are memoized by name with a read-then-write double-check, so
//! concurrent first emissions of the same metric create exactly one
//! instrument and later emissions are a read-lock and a clone of an
//! `Arc`-backed handle. Declarations pre-create their instruments at
//! initialization time; everything else is created on first use.
//!
//! Observable gauges are callback-driven. Registration stores the callback in
//! a slot the SDK-side closure reads on every collection, which makes
//! unregistration a matter of clearing the slot — no interaction with the SDK
//! callback machinery is needed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use opentelemetry::metrics::{AsyncInstrument as _, Counter, Histogram, Meter, UpDownCounter};
use opentelemetry::KeyValue;
use tracing::debug;

use crate::error::GomindError;
use crate::telemetry::declared::{MetricDefinition, MetricKind};
use crate::Result;

type GaugeCallback = Box<dyn Fn() -> f64 + Send + Sync>;

struct GaugeRegistration {
    callback: Arc<Mutex<Option<GaugeCallback>>>,
}

/// Memoized instrument registry bound to one meter.
pub struct MetricInstruments {
    meter: Meter,
    counters: RwLock<HashMap<String, Counter<u64>>>,
    float_counters: RwLock<HashMap<String, Counter<f64>>>,
    up_down_counters: RwLock<HashMap<String, UpDownCounter<i64>>>,
    histograms: RwLock<HashMap<String, Histogram<f64>>>,
    gauges: Mutex<HashMap<String, GaugeRegistration>>,
}

impl MetricInstruments {
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            counters: RwLock::new(HashMap::new()),
            float_counters: RwLock::new(HashMap::new()),
            up_down_counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
        }
    }

    /// Record a monotonically increasing count
    pub fn record_counter(&self, name: &str, value: u64, labels: &[KeyValue]) {
        self.counter(name, None).add(value, labels);
    }

    /// Record a monotonically increasing fractional count
    pub fn record_float_counter(&self, name: &str, value: f64, labels: &[KeyValue]) {
        self.float_counter(name, None).add(value, labels);
    }

    /// Record a value that can go up and down
    pub fn record_up_down_counter(&self, name: &str, value: i64, labels: &[KeyValue]) {
        self.up_down_counter(name, None).add(value, labels);
    }

    /// Record a distribution sample
    pub fn record_histogram(&self, name: &str, value: f64, labels: &[KeyValue]) {
        self.histogram(name, None).record(value, labels);
    }

    /// Register an observable gauge observed on every metric collection.
    ///
    /// Fails with a configuration error when `name` is already registered.
    /// The callback runs on the exporter's collection task and must be
    /// thread-safe.
    pub fn register_gauge<F>(&self, name: &str, callback: F) -> Result<()>
    where
        F: Fn() -> f64 + Send + Sync + 'static,
    {
        let mut gauges = self.gauges.lock().unwrap_or_else(|e| e.into_inner());
        if gauges.contains_key(name) {
            return Err(GomindError::configuration_error(format!(
                "duplicate gauge registration: {}",
                name
            )));
        }

        let slot: Arc<Mutex<Option<GaugeCallback>>> = Arc::new(Mutex::new(Some(Box::new(callback))));
        let observed = slot.clone();
        let _gauge = self
            .meter
            .f64_observable_gauge(name.to_string())
            .with_callback(move |observer| {
                let guard = observed.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(callback) = guard.as_ref() {
                    observer.observe(callback(), &[]);
                }
            })
            .init();

        gauges.insert(name.to_string(), GaugeRegistration { callback: slot });
        debug!(gauge = name, "observable gauge registered");
        Ok(())
    }

    /// Detach a gauge callback. Collections after this observe nothing.
    pub fn unregister_gauge(&self, name: &str) -> Result<()> {
        let mut gauges = self.gauges.lock().unwrap_or_else(|e| e.into_inner());
        match gauges.remove(name) {
            Some(registration) => {
                registration
                    .callback
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .take();
                debug!(gauge = name, "observable gauge unregistered");
                Ok(())
            }
            None => Err(GomindError::configuration_error(format!(
                "gauge not registered: {}",
                name
            ))),
        }
    }

    /// Pre-create the instrument for a declaration so first emission pays no
    /// creation cost. Gauges are callback-driven and skipped here.
    pub fn pre_register(&self, definition: &MetricDefinition) {
        match definition.kind {
            MetricKind::Counter => {
                self.counter(&definition.name, Some(definition));
            }
            MetricKind::UpDownCounter => {
                self.up_down_counter(&definition.name, Some(definition));
            }
            MetricKind::Histogram => {
                self.histogram(&definition.name, Some(definition));
            }
            MetricKind::ObservableGauge => {}
        }
    }

    /// Unregister every gauge, aggregating failures.
    pub fn shutdown(&self) -> Result<()> {
        let names: Vec<String> = {
            let gauges = self.gauges.lock().unwrap_or_else(|e| e.into_inner());
            gauges.keys().cloned().collect()
        };
        let mut errors = Vec::new();
        for name in names {
            if let Err(error) = self.unregister_gauge(&name) {
                errors.push(format!("{}: {}", name, error));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(GomindError::shutdown_partial_failure(&errors))
        }
    }

    fn counter(&self, name: &str, definition: Option<&MetricDefinition>) -> Counter<u64> {
        if let Ok(map) = self.counters.read() {
            if let Some(counter) = map.get(name) {
                return counter.clone();
            }
        }
        let mut map = self.counters.write().unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = map.get(name) {
            return counter.clone();
        }
        let mut builder = self.meter.u64_counter(name.to_string());
        if let Some(definition) = definition {
            builder = builder.with_description(definition.description.clone());
            if !definition.unit.is_empty() {
                builder = builder.with_unit(definition.unit.clone());
            }
        }
        let counter = builder.init();
        map.insert(name.to_string(), counter.clone());
        counter
    }

    fn float_counter(&self, name: &str, definition: Option<&MetricDefinition>) -> Counter<f64> {
        if let Ok(map) = self.float_counters.read() {
            if let Some(counter) = map.get(name) {
                return counter.clone();
            }
        }
        let mut map = self
            .float_counters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = map.get(name) {
            return counter.clone();
        }
        let mut builder = self.meter.f64_counter(name.to_string());
        if let Some(definition) = definition {
            builder = builder.with_description(definition.description.clone());
            if !definition.unit.is_empty() {
                builder = builder.with_unit(definition.unit.clone());
            }
        }
        let counter = builder.init();
        map.insert(name.to_string(), counter.clone());
        counter
    }

    fn up_down_counter(
        &self,
        name: &str,
        definition: Option<&MetricDefinition>,
    ) -> UpDownCounter<i64> {
        if let Ok(map) = self.up_down_counters.read() {
            if let Some(counter) = map.get(name) {
                return counter.clone();
            }
        }
        let mut map = self
            .up_down_counters
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(counter) = map.get(name) {
            return counter.clone();
        }
        let mut builder = self.meter.i64_up_down_counter(name.to_string());
        if let Some(definition) = definition {
            builder = builder.with_description(definition.description.clone());
            if !definition.unit.is_empty() {
                builder = builder.with_unit(definition.unit.clone());
            }
        }
        let counter = builder.init();
        map.insert(name.to_string(), counter.clone());
        counter
    }

    fn histogram(&self, name: &str, definition: Option<&MetricDefinition>) -> Histogram<f64> {
        if let Ok(map) = self.histograms.read() {
            if let Some(histogram) = map.get(name) {
                return histogram.clone();
            }
        }
        let mut map = self.histograms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(histogram) = map.get(name) {
            return histogram.clone();
        }
        let mut builder = self.meter.f64_histogram(name.to_string());
        if let Some(definition) = definition {
            builder = builder.with_description(definition.description.clone());
            if !definition.unit.is_empty() {
                builder = builder.with_unit(definition.unit.clone());
            }
        }
        let histogram = builder.init();
        map.insert(name.to_string(), histogram.clone());
        histogram
    }
}
