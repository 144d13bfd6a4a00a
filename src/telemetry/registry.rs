//! Process-wide telemetry registry.
//!
//! The registry owns the provider, cardinality limiter, circuit breaker, and
//! logger, and is the single entry point for metric emission. It lives in a
//! process-wide slot: initialization publishes it once, shutdown clears it,
//! and every `emit` starts with a slot read that turns into a silent no-op
//! when telemetry is uninitialized or already torn down. The application
//! never changes behavior because observability is absent.
//!
//! Initialization is idempotent — concurrent `init` calls race on a latch
//! and exactly one performs the setup; the rest observe the initialized
//! state and return Ok.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use opentelemetry::{Context, KeyValue};
use serde::Serialize;

use crate::component::{set_framework_metrics, FrameworkMetrics};
use crate::error::GomindError;
use crate::telemetry::baggage;
use crate::telemetry::cardinality::CardinalityLimiter;
use crate::telemetry::circuit::CircuitBreaker;
use crate::telemetry::declared::drain_declarations;
use crate::telemetry::logger::{PiiRedactor, TelemetryLogger};
use crate::telemetry::provider::OtelProvider;
use crate::telemetry::TelemetryConfig;
use crate::Result;

static REGISTRY: Lazy<RwLock<Option<Arc<TelemetryRegistry>>>> = Lazy::new(|| RwLock::new(None));
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Snapshot of the registry's self-observation counters.
#[derive(Debug, Clone, Serialize)]
pub struct InternalMetrics {
    pub metrics_emitted: u64,
    pub metrics_dropped: u64,
    pub errors: u64,
    pub last_error: Option<String>,
    pub uptime_seconds: u64,
}

/// Owns the telemetry plane. Obtain through [`init`] / [`registry`].
pub struct TelemetryRegistry {
    config: TelemetryConfig,
    provider: OtelProvider,
    limiter: CardinalityLimiter,
    circuit: CircuitBreaker,
    logger: Arc<TelemetryLogger>,
    started_at: Instant,
    emitted: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl TelemetryRegistry {
    /// Emit one metric observation through the full safety pipeline:
    /// circuit check, baggage merge, cardinality bounding, provider dispatch.
    pub fn emit(
        &self,
        ctx: Option<&Context>,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
        use_circuit: bool,
        sample_rate: Option<f64>,
    ) {
        if let Some(rate) = sample_rate {
            if rate < 1.0 && fastrand::f64() >= rate.max(0.0) {
                return;
            }
        }

        if use_circuit && !self.circuit.allow() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Err(error) = self.dispatch(ctx, name, value, labels) {
            self.errors.fetch_add(1, Ordering::Relaxed);
            if use_circuit {
                self.circuit.record_failure();
            }
            let message = error.to_string();
            *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.clone());
            self.logger.error(
                "metric emission failed",
                &[
                    ("component", "registry"),
                    ("operation", "emit"),
                    ("error", &message),
                    ("error_type", error.class()),
                ],
            );
            return;
        }

        if use_circuit {
            self.circuit.record_success();
        }
        self.emitted.fetch_add(1, Ordering::Relaxed);
    }

    fn dispatch(
        &self,
        ctx: Option<&Context>,
        name: &str,
        value: f64,
        labels: &[(&str, &str)],
    ) -> Result<()> {
        if name.is_empty() {
            return Err(GomindError::invalid_input("metric name cannot be empty"));
        }

        let flat: Vec<String> = labels
            .iter()
            .flat_map(|(k, v)| [k.to_string(), v.to_string()])
            .collect();

        let merged = match ctx {
            Some(ctx) => baggage::append_baggage_to_labels(ctx, &flat),
            None => baggage::append_baggage_to_labels(&Context::new(), &flat),
        };

        let mut key_values = Vec::with_capacity(merged.len() / 2);
        for chunk in merged.chunks_exact(2) {
            let key = &chunk[0];
            let bounded = self.limiter.limit_value(name, key, &chunk[1]);
            key_values.push(KeyValue::new(key.clone(), bounded));
        }
        baggage::return_label_slice(merged);

        self.provider.record_metric(name, value, &key_values);
        Ok(())
    }

    pub fn circuit_state(&self) -> &'static str {
        self.circuit.state()
    }

    pub fn provider(&self) -> &OtelProvider {
        &self.provider
    }

    pub fn logger(&self) -> Arc<TelemetryLogger> {
        self.logger.clone()
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn cardinality_used(&self) -> usize {
        self.limiter.current_cardinality()
    }

    pub fn cardinality_max(&self) -> usize {
        self.limiter.max_cardinality()
    }

    pub fn internal_metrics(&self) -> InternalMetrics {
        InternalMetrics {
            metrics_emitted: self.emitted.load(Ordering::Relaxed),
            metrics_dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone(),
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub fn reset_internal_metrics(&self) {
        self.emitted.store(0, Ordering::Relaxed);
        self.dropped.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Initialize the process-wide telemetry plane. At most one call takes
/// effect; later calls (from any thread) are no-ops returning Ok.
///
/// When the configured service type is absent, the last-created-component
/// marker is consulted, so construct your component before initializing
/// telemetry if you rely on the inference.
pub fn init(config: TelemetryConfig) -> Result<()> {
    if INITIALIZED.swap(true, Ordering::SeqCst) {
        return Ok(());
    }

    if !config.enabled {
        // Leave the slot empty: emissions stay silent no-ops.
        return Ok(());
    }

    let redactor = if config.pii_redaction {
        Some(PiiRedactor::new(&config.pii_patterns))
    } else {
        None
    };
    let logger = TelemetryLogger::global(&config.service_name, redactor);

    let provider = match OtelProvider::new(
        &config.service_name,
        config.service_type,
        &config.endpoint,
        config.provider,
        config.sampling_rate,
        logger.clone(),
    ) {
        Ok(provider) => provider,
        Err(error) => {
            INITIALIZED.store(false, Ordering::SeqCst);
            logger.error(
                "telemetry initialization failed; running without observability",
                &[
                    ("component", "registry"),
                    ("endpoint", &config.endpoint),
                    ("error", &error.to_string()),
                    (
                        "action",
                        "verify the OTLP collector endpoint and retry init",
                    ),
                ],
            );
            return Err(error);
        }
    };

    let limiter = CardinalityLimiter::new(config.cardinality_limit, &config.cardinality_limits);
    limiter.start_cleanup();

    let circuit = CircuitBreaker::new("telemetry-export", config.circuit_breaker.clone());

    // Pre-create declared instruments so the hot path never pays first-use
    // creation.
    let instruments = provider.instruments();
    for definition in drain_declarations() {
        instruments.pre_register(&definition);
    }
    logger.set_ops_sink(Some(instruments));

    let registry = Arc::new(TelemetryRegistry {
        config,
        provider,
        limiter,
        circuit,
        logger,
        started_at: Instant::now(),
        emitted: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        errors: AtomicU64::new(0),
        last_error: Mutex::new(None),
    });

    set_framework_metrics(Some(Arc::new(RegistryShim {
        registry: registry.clone(),
    })));

    let mut slot = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    *slot = Some(registry);
    Ok(())
}

/// Current registry, if initialized and not shut down
pub fn registry() -> Option<Arc<TelemetryRegistry>> {
    REGISTRY.read().ok().and_then(|slot| slot.clone())
}

/// True once `init` has effectuated (and until shutdown)
pub fn is_initialized() -> bool {
    registry().is_some()
}

/// Tear the telemetry plane down. Stops the cardinality cleanup task, shuts
/// the provider down within `timeout`, clears the framework shim, and nils
/// the slot so subsequent emissions no-op.
pub async fn shutdown(timeout: Duration) -> Result<()> {
    let registry = {
        let mut slot = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
        slot.take()
    };
    INITIALIZED.store(false, Ordering::SeqCst);
    set_framework_metrics(None);

    let Some(registry) = registry else {
        return Ok(());
    };

    registry.limiter.stop();
    registry.logger.set_ops_sink(None);

    let shutdown_result =
        tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || {
            registry.provider.shutdown()
        }))
        .await;

    match shutdown_result {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => Err(GomindError::internal_error(format!(
            "provider shutdown task failed: {}",
            join_error
        ))),
        Err(_) => Err(GomindError::timeout_error(timeout.as_millis() as u64)),
    }
}

/// Framework shim installed into the core module on initialization.
struct RegistryShim {
    registry: Arc<TelemetryRegistry>,
}

impl FrameworkMetrics for RegistryShim {
    fn counter(&self, name: &str, labels: &[(&str, &str)]) {
        self.registry.emit(None, name, 1.0, labels, true, None);
    }

    fn emit_with_context(&self, ctx: &Context, name: &str, value: f64, labels: &[(&str, &str)]) {
        self.registry.emit(Some(ctx), name, value, labels, true, None);
    }

    fn get_baggage(&self, ctx: &Context) -> HashMap<String, String> {
        baggage::get_baggage(ctx)
    }
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    let mut slot = REGISTRY.write().unwrap_or_else(|e| e.into_inner());
    *slot = None;
    INITIALIZED.store(false, Ordering::SeqCst);
    set_framework_metrics(None);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::ExporterKind;

    // These tests mutate process-wide state; serialize them.
    static TEST_LOCK: Lazy<tokio::sync::Mutex<()>> = Lazy::new(|| tokio::sync::Mutex::new(()));

    fn offline_config() -> TelemetryConfig {
        TelemetryConfig {
            enabled: true,
            service_name: "registry-test".to_string(),
            provider: ExporterKind::None,
            ..TelemetryConfig::default()
        }
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        assert!(init(offline_config()).is_ok());
        assert!(is_initialized());
        // Second call observes the initialized state and returns Ok
        assert!(init(offline_config()).is_ok());
        shutdown(Duration::from_secs(1)).await.ok();
        reset_for_tests();
    }

    #[tokio::test]
    async fn test_concurrent_init_single_winner() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        let handles: Vec<_> = (0..8)
            .map(|_| tokio::task::spawn_blocking(|| init(offline_config())))
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
        assert!(is_initialized());
        shutdown(Duration::from_secs(1)).await.ok();
        reset_for_tests();
    }

    #[tokio::test]
    async fn test_emit_before_init_is_silent() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        // No registry in the slot: must not panic or record anything
        assert!(registry().is_none());
        crate::telemetry::api::counter("gomind.test.count", &[]);
        reset_for_tests();
    }

    #[tokio::test]
    async fn test_emit_after_shutdown_is_silent() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        init(offline_config()).unwrap();
        shutdown(Duration::from_secs(1)).await.ok();
        assert!(!is_initialized());
        crate::telemetry::api::counter("gomind.test.count", &[]);
        reset_for_tests();
    }

    #[tokio::test]
    async fn test_emission_counters_advance() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        init(offline_config()).unwrap();
        let registry = registry().unwrap();
        registry.emit(None, "gomind.test.count", 1.0, &[("k", "v")], true, None);
        let metrics = registry.internal_metrics();
        assert_eq!(metrics.metrics_emitted, 1);
        assert_eq!(metrics.errors, 0);

        registry.reset_internal_metrics();
        assert_eq!(registry.internal_metrics().metrics_emitted, 0);
        shutdown(Duration::from_secs(1)).await.ok();
        reset_for_tests();
    }

    #[tokio::test]
    async fn test_empty_metric_name_counts_error() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        init(offline_config()).unwrap();
        let registry = registry().unwrap();
        registry.emit(None, "", 1.0, &[], false, None);
        let metrics = registry.internal_metrics();
        assert_eq!(metrics.errors, 1);
        assert!(metrics.last_error.is_some());
        shutdown(Duration::from_secs(1)).await.ok();
        reset_for_tests();
    }

    #[tokio::test]
    async fn test_disabled_config_leaves_slot_empty() {
        let _guard = TEST_LOCK.lock().await;
        reset_for_tests();
        let config = TelemetryConfig {
            enabled: false,
            ..offline_config()
        };
        assert!(init(config).is_ok());
        assert!(!is_initialized());
        reset_for_tests();
    }
}
