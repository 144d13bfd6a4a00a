//! OpenTelemetry provider lifecycle and metric dispatch.
//!
//! Owns the tracer provider, the meter provider, and the OTLP/HTTP exporters
//! behind them. Construction wires the full export pipeline — batched span
//! processor, 30-second periodic metric reader, W3C composite propagator —
//! and hands back a provider whose `record_metric` routes a bare
//! `(name, value, labels)` triple to the right instrument kind.
//!
//! Kind resolution prefers an explicit declaration (see
//! [`crate::telemetry::declared`]); the name-substring heuristic is the
//! compatibility fallback for undeclared metrics.

use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::metrics::MeterProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use opentelemetry_sdk::export::trace::SpanExporter as SpanExporterTrait;
use opentelemetry_sdk::metrics::reader::{DefaultAggregationSelector, DefaultTemporalitySelector};
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry::propagation::TextMapCompositePropagator;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use opentelemetry_sdk::trace::{Sampler, TracerProvider};
use opentelemetry_sdk::Resource;

use crate::component::{last_component_type, ComponentType};
use crate::error::GomindError;
use crate::telemetry::declared::{declared_kind, MetricKind};
use crate::telemetry::instruments::MetricInstruments;
use crate::telemetry::logger::TelemetryLogger;
use crate::telemetry::ExporterKind;
use crate::Result;

/// Default OTLP/HTTP endpoint
pub const DEFAULT_ENDPOINT: &str = "localhost:4318";

const METRIC_EXPORT_INTERVAL: Duration = Duration::from_secs(30);

/// Wraps the tracer and meter providers plus the instrument table.
pub struct OtelProvider {
    service_name: String,
    endpoint: String,
    kind: ExporterKind,
    instruments: Arc<MetricInstruments>,
    meter_provider: SdkMeterProvider,
    tracer_provider: TracerProvider,
    logger: Arc<TelemetryLogger>,
}

impl OtelProvider {
    /// Build the provider and install the global tracer provider, meter
    /// provider, and W3C TraceContext+Baggage propagator.
    ///
    /// The propagator is set exactly once here — the HTTP middleware never
    /// touches it, so user overrides applied before initialization survive.
    pub fn new(
        service_name: &str,
        service_type: Option<ComponentType>,
        endpoint: &str,
        kind: ExporterKind,
        sampling_rate: f64,
        logger: Arc<TelemetryLogger>,
    ) -> Result<Self> {
        if service_name.is_empty() {
            return Err(GomindError::invalid_input(
                "service name cannot be empty when telemetry is enabled",
            ));
        }

        let endpoint = normalize_endpoint(endpoint);
        let resource = build_resource(service_name, service_type);
        let sampler = build_sampler(sampling_rate);

        let (tracer_provider, meter_provider) = match kind {
            ExporterKind::Otlp => {
                Self::build_otlp_providers(&endpoint, resource, sampler, &logger)?
            }
            ExporterKind::Stdout => Self::build_stdout_providers(resource, sampler),
            ExporterKind::None => Self::build_noop_providers(resource, sampler),
        };

        global::set_tracer_provider(tracer_provider.clone());
        global::set_meter_provider(meter_provider.clone());
        global::set_text_map_propagator(TextMapCompositePropagator::new(vec![
            Box::new(TraceContextPropagator::new()),
            Box::new(BaggagePropagator::new()),
        ]));

        let instruments = Arc::new(MetricInstruments::new(
            meter_provider.meter("gomind-telemetry"),
        ));

        logger.info(
            "telemetry provider initialized",
            &[
                ("endpoint", &endpoint),
                ("provider", kind.as_str()),
                ("component", "provider"),
            ],
        );

        Ok(Self {
            service_name: service_name.to_string(),
            endpoint,
            kind,
            instruments,
            meter_provider,
            tracer_provider,
            logger,
        })
    }

    fn build_otlp_providers(
        endpoint: &str,
        resource: Resource,
        sampler: Sampler,
        logger: &TelemetryLogger,
    ) -> Result<(TracerProvider, SdkMeterProvider)> {
        let traces_endpoint = format!("{}/v1/traces", endpoint);
        let mut trace_exporter = opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(traces_endpoint.clone())
            .build_span_exporter()
            .map_err(|e| {
                GomindError::configuration_error(format!(
                    "failed to build OTLP trace exporter for {}: {}. \
                     Verify the collector is reachable: curl -s {}",
                    traces_endpoint, e, traces_endpoint
                ))
            })?;

        let metrics_endpoint = format!("{}/v1/metrics", endpoint);
        let metric_exporter = match opentelemetry_otlp::new_exporter()
            .http()
            .with_endpoint(metrics_endpoint.clone())
            .build_metrics_exporter(
                Box::new(DefaultAggregationSelector::new()),
                Box::new(DefaultTemporalitySelector::new()),
            ) {
            Ok(exporter) => exporter,
            Err(e) => {
                // The trace exporter already holds resources; release them
                // before surfacing the error.
                trace_exporter.shutdown();
                logger.error(
                    "metric exporter build failed, rolled back trace exporter",
                    &[
                        ("endpoint", &metrics_endpoint),
                        ("error", &e.to_string()),
                        ("component", "provider"),
                        ("action", "check OTLP collector metrics support"),
                    ],
                );
                return Err(GomindError::configuration_error(format!(
                    "failed to build OTLP metric exporter for {}: {}",
                    metrics_endpoint, e
                )));
            }
        };

        let batch_processor = opentelemetry_sdk::trace::BatchSpanProcessor::builder(
            trace_exporter,
            opentelemetry_sdk::runtime::Tokio,
        )
        .build();

        let tracer_provider = TracerProvider::builder()
            .with_config(
                opentelemetry_sdk::trace::Config::default()
                    .with_resource(resource.clone())
                    .with_sampler(sampler),
            )
            .with_span_processor(batch_processor)
            .build();

        let reader = PeriodicReader::builder(metric_exporter, opentelemetry_sdk::runtime::Tokio)
            .with_interval(METRIC_EXPORT_INTERVAL)
            .build();

        let meter_provider = SdkMeterProvider::builder()
            .with_resource(resource)
            .with_reader(reader)
            .build();

        Ok((tracer_provider, meter_provider))
    }

    fn build_stdout_providers(
        resource: Resource,
        sampler: Sampler,
    ) -> (TracerProvider, SdkMeterProvider) {
        let console_exporter = opentelemetry_stdout::SpanExporter::default();
        let processor = opentelemetry_sdk::trace::BatchSpanProcessor::builder(
            console_exporter,
            opentelemetry_sdk::runtime::Tokio,
        )
        .build();

        let tracer_provider = TracerProvider::builder()
            .with_config(
                opentelemetry_sdk::trace::Config::default()
                    .with_resource(resource.clone())
                    .with_sampler(sampler),
            )
            .with_span_processor(processor)
            .build();

        // Console mode keeps instruments working without a metric exporter
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();

        (tracer_provider, meter_provider)
    }

    fn build_noop_providers(
        resource: Resource,
        sampler: Sampler,
    ) -> (TracerProvider, SdkMeterProvider) {
        let tracer_provider = TracerProvider::builder()
            .with_config(
                opentelemetry_sdk::trace::Config::default()
                    .with_resource(resource.clone())
                    .with_sampler(sampler),
            )
            .build();
        let meter_provider = SdkMeterProvider::builder().with_resource(resource).build();
        (tracer_provider, meter_provider)
    }

    /// Route a metric value to the instrument kind for its name.
    pub fn record_metric(&self, name: &str, value: f64, labels: &[KeyValue]) {
        let kind = declared_kind(name).unwrap_or_else(|| infer_kind(name));
        match kind {
            MetricKind::Counter => self.instruments.record_counter(name, value as u64, labels),
            MetricKind::UpDownCounter => {
                self.instruments
                    .record_up_down_counter(name, value as i64, labels)
            }
            // Gauges recorded by value go through the histogram proxy; true
            // gauges use the register_gauge callback API.
            MetricKind::Histogram | MetricKind::ObservableGauge => {
                self.instruments.record_histogram(name, value, labels)
            }
        }
    }

    pub fn instruments(&self) -> Arc<MetricInstruments> {
        self.instruments.clone()
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    pub fn exporter_kind(&self) -> ExporterKind {
        self.kind
    }

    /// Shut the export pipeline down in dependency order: instruments, then
    /// the meter provider (flushes pending metrics), then the tracer provider
    /// (flushes pending spans). Every step is attempted even when an earlier
    /// one failed; the caller gets the aggregate.
    pub fn shutdown(&self) -> Result<()> {
        let mut errors = Vec::new();

        let started = Instant::now();
        self.logger.info(
            "shutting down instruments",
            &[("component", "provider"), ("operation", "shutdown")],
        );
        if let Err(error) = self.instruments.shutdown() {
            errors.push(format!("instruments: {}", error));
            self.logger.error(
                "instrument shutdown failed",
                &[("component", "provider"), ("error", &error.to_string())],
            );
        }
        let instruments_ms = started.elapsed().as_millis().to_string();
        self.logger.debug(
            "instrument shutdown finished",
            &[("component", "provider"), ("duration_ms", &instruments_ms)],
        );

        let started = Instant::now();
        if let Err(error) = self.meter_provider.force_flush() {
            errors.push(format!("meter provider flush: {}", error));
        }
        if let Err(error) = self.meter_provider.shutdown() {
            errors.push(format!("meter provider: {}", error));
            self.logger.error(
                "meter provider shutdown failed",
                &[("component", "provider"), ("error", &error.to_string())],
            );
        }
        let meter_ms = started.elapsed().as_millis().to_string();
        self.logger.debug(
            "meter provider shutdown finished",
            &[("component", "provider"), ("duration_ms", &meter_ms)],
        );

        let started = Instant::now();
        for result in self.tracer_provider.force_flush() {
            if let Err(error) = result {
                errors.push(format!("tracer provider flush: {}", error));
            }
        }
        global::shutdown_tracer_provider();
        let tracer_ms = started.elapsed().as_millis().to_string();
        self.logger.debug(
            "tracer provider shutdown finished",
            &[("component", "provider"), ("duration_ms", &tracer_ms)],
        );

        if errors.is_empty() {
            self.logger.info(
                "telemetry provider shutdown complete",
                &[("component", "provider"), ("status", "ok")],
            );
            Ok(())
        } else {
            Err(GomindError::shutdown_partial_failure(&errors))
        }
    }
}

/// Normalize a configured endpoint into a full `http(s)://host:port` base.
///
/// Empty input falls back to the OTLP/HTTP default. The gRPC default port
/// 4317 is rewritten to 4318 so configurations written against the gRPC
/// binding keep working over HTTP.
pub fn normalize_endpoint(endpoint: &str) -> String {
    let raw = if endpoint.is_empty() {
        DEFAULT_ENDPOINT
    } else {
        endpoint
    };
    let rewritten = raw.replace(":4317", ":4318");
    let with_scheme = if rewritten.starts_with("http://") || rewritten.starts_with("https://") {
        rewritten
    } else {
        format!("http://{}", rewritten)
    };
    with_scheme.trim_end_matches('/').to_string()
}

fn build_resource(service_name: &str, service_type: Option<ComponentType>) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, service_name.to_string()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];

    let resolved_type = service_type
        .or_else(|| {
            std::env::var("GOMIND_SERVICE_TYPE")
                .ok()
                .and_then(|raw| ComponentType::parse(&raw))
        })
        .or_else(last_component_type);
    if let Some(component_type) = resolved_type {
        attributes.push(KeyValue::new("service.type", component_type.as_str()));
    }

    Resource::new(attributes)
}

fn build_sampler(sampling_rate: f64) -> Sampler {
    if sampling_rate >= 1.0 {
        Sampler::AlwaysOn
    } else if sampling_rate <= 0.0 {
        Sampler::AlwaysOff
    } else {
        Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(sampling_rate)))
    }
}

/// Fallback kind inference from name prefix/suffix substrings.
fn infer_kind(name: &str) -> MetricKind {
    let matches_hint =
        |hints: &[&str]| hints.iter().any(|h| name.starts_with(h) || name.ends_with(h));

    if matches_hint(&["duration", "latency", "time"]) {
        return MetricKind::Histogram;
    }
    if matches_hint(&["count", "total", "errors", "success"]) {
        return MetricKind::Counter;
    }
    if matches_hint(&["gauge", "current", "size", "queue"]) {
        // Gauge proxy: recorded as a histogram so point-in-time values still
        // export without a callback registration
        return MetricKind::Histogram;
    }
    MetricKind::Histogram
}
