//! Distributed trace propagation over HTTP.
//!
//! Three pieces stitch the telemetry plane together across process
//! boundaries:
//!
//! - [`TracingLayer`] — tower middleware for inbound requests: extracts W3C
//!   `traceparent`/`tracestate`/`baggage` headers, opens a server span named
//!   `HTTP {METHOD} {PATH}`, and records request metrics.
//! - [`TracedHttpClient`] — outbound: injects the current span context into
//!   request headers so the next hop continues the trace.
//! - [`start_linked_span`] — async continuation for queue-based workers: a
//!   new span *linked* (not parented) to a stored trace/span id pair, so the
//!   work shows up correlated with its origin without pretending the origin
//!   is still on the call stack.
//!
//! The middleware deliberately does not install the global propagator; that
//! happens exactly once in `telemetry::init` so user overrides survive.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use http::{HeaderName, HeaderValue, Method, Request, Response};
use opentelemetry::propagation::TextMapPropagator as _;
use opentelemetry::trace::{
    Link, Span, SpanContext, SpanId, SpanKind, TraceContextExt, TraceFlags, TraceId, TraceState,
    Tracer,
};
use opentelemetry::{global, Context, KeyValue};
use tower::{Layer, Service};
use tracing::debug;

use crate::telemetry::api;

const TRACER_NAME: &str = "gomind-tracing";

type SpanNameFormatter = Arc<dyn Fn(&Method, &str) -> String + Send + Sync>;

/// Middleware configuration.
#[derive(Clone)]
pub struct TracingConfig {
    pub service_name: String,
    /// Paths that skip span creation entirely (health probes, metrics)
    pub excluded_paths: Vec<String>,
    /// Override for the default `HTTP {METHOD} {PATH}` span name
    pub span_name_formatter: Option<SpanNameFormatter>,
}

impl TracingConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            excluded_paths: Vec::new(),
            span_name_formatter: None,
        }
    }

    pub fn with_excluded_paths(mut self, paths: &[&str]) -> Self {
        self.excluded_paths = paths.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_span_name_formatter<F>(mut self, formatter: F) -> Self
    where
        F: Fn(&Method, &str) -> String + Send + Sync + 'static,
    {
        self.span_name_formatter = Some(Arc::new(formatter));
        self
    }

    fn span_name(&self, method: &Method, path: &str) -> String {
        match &self.span_name_formatter {
            Some(formatter) => formatter(method, path),
            None => format!("HTTP {} {}", method, path),
        }
    }
}

/// Tower layer wrapping a service with trace extraction and span creation.
///
/// ```rust,no_run
/// use axum::{routing::get, Router};
/// use gomind::tracing::TracingLayer;
///
/// let app: Router = Router::new()
///     .route("/chat", get(|| async { "ok" }))
///     .layer(TracingLayer::new("chat-agent"));
/// ```
#[derive(Clone)]
pub struct TracingLayer {
    config: Arc<TracingConfig>,
}

impl TracingLayer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self::with_config(TracingConfig::new(service_name))
    }

    pub fn with_config(config: TracingConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }
}

impl<S> Layer<S> for TracingLayer {
    type Service = TracingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TracingService {
            inner,
            config: self.config.clone(),
        }
    }
}

/// Service produced by [`TracingLayer`].
#[derive(Clone)]
pub struct TracingService<S> {
    inner: S,
    config: Arc<TracingConfig>,
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for TracingService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<S::Response, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut TaskContext<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<ReqBody>) -> Self::Future {
        // Clone-and-swap so the ready-polled instance does the work
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();

        Box::pin(async move {
            let path = request.uri().path().to_string();
            if config.excluded_paths.iter().any(|excluded| excluded == &path) {
                return inner.call(request).await;
            }

            let method = request.method().clone();
            let parent = extract_context(request.headers());
            let span_name = config.span_name(&method, &path);

            let tracer = global::tracer(TRACER_NAME);
            let mut span = tracer
                .span_builder(span_name)
                .with_kind(SpanKind::Server)
                .with_attributes(vec![
                    KeyValue::new("http.request.method", method.to_string()),
                    KeyValue::new("url.path", path.clone()),
                    KeyValue::new("service.name", config.service_name.clone()),
                ])
                .start_with_context(&tracer, &parent);

            let started = Instant::now();
            let result = inner.call(request).await;
            let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

            let method_label = method.to_string();
            match &result {
                Ok(response) => {
                    let status = response.status();
                    span.set_attribute(KeyValue::new(
                        "http.response.status_code",
                        status.as_u16() as i64,
                    ));
                    if status.is_server_error() {
                        span.set_status(opentelemetry::trace::Status::error(format!(
                            "HTTP {}",
                            status.as_u16()
                        )));
                    }
                    let status_label = status.as_u16().to_string();
                    let labels = [
                        ("method", method_label.as_str()),
                        ("path", path.as_str()),
                        ("status", status_label.as_str()),
                    ];
                    api::counter("gomind.http.request.count", &labels);
                    api::histogram("gomind.http.request.duration", elapsed_ms, &labels);
                }
                Err(_) => {
                    span.set_status(opentelemetry::trace::Status::error("handler error"));
                    api::counter(
                        "gomind.http.request.errors",
                        &[("method", method_label.as_str()), ("path", path.as_str())],
                    );
                }
            }
            span.end();
            result
        })
    }
}

/// Extract the remote trace context and baggage from inbound headers using
/// the globally installed propagator.
pub fn extract_context(headers: &http::HeaderMap) -> Context {
    let mut carrier = HashMap::new();
    for (name, value) in headers {
        if let Ok(value) = value.to_str() {
            carrier.insert(name.as_str().to_string(), value.to_string());
        }
    }
    global::get_text_map_propagator(|propagator| propagator.extract(&carrier))
}

/// Inject `ctx` into an outbound header map as W3C headers.
pub fn inject_context(ctx: &Context, headers: &mut http::HeaderMap) {
    let mut carrier: HashMap<String, String> = HashMap::new();
    global::get_text_map_propagator(|propagator| propagator.inject_context(ctx, &mut carrier));
    for (key, value) in carrier {
        let name = match HeaderName::try_from(key.as_str()) {
            Ok(name) => name,
            Err(_) => continue,
        };
        if let Ok(value) = HeaderValue::try_from(value.as_str()) {
            headers.insert(name, value);
        }
    }
}

/// HTTP client wrapper that injects the current span context into every
/// outgoing request.
#[derive(Debug, Clone)]
pub struct TracedHttpClient {
    inner: reqwest::Client,
}

impl TracedHttpClient {
    /// Convenience constructor with pooled-connection defaults: 10 idle
    /// connections per host, 90 s idle timeout.
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();
        Self { inner: client }
    }

    /// Wrap an existing client (custom TLS, proxies, timeouts)
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { inner: client }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.inner
    }

    /// Execute a request with the current context's trace headers injected
    pub async fn execute(&self, request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        self.execute_with_context(&Context::current(), request).await
    }

    /// Execute a request carrying an explicit context
    pub async fn execute_with_context(
        &self,
        ctx: &Context,
        mut request: reqwest::Request,
    ) -> reqwest::Result<reqwest::Response> {
        inject_context(ctx, request.headers_mut());
        self.inner.execute(request).await
    }

    /// Start a request builder; trace headers for the current context are
    /// pre-applied.
    pub fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut headers = http::HeaderMap::new();
        inject_context(&Context::current(), &mut headers);
        self.inner.request(method, url).headers(headers)
    }
}

impl Default for TracedHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Span handle with explicit, single-use completion.
pub struct TelemetrySpan {
    span: opentelemetry::global::BoxedSpan,
    started: Instant,
}

impl TelemetrySpan {
    fn new(span: opentelemetry::global::BoxedSpan) -> Self {
        Self {
            span,
            started: Instant::now(),
        }
    }

    pub fn set_attribute(&mut self, key: &str, value: impl Into<opentelemetry::Value>) {
        self.span.set_attribute(KeyValue::new(key.to_string(), value));
    }

    pub fn set_success(&mut self) {
        self.span.set_status(opentelemetry::trace::Status::Ok);
    }

    pub fn set_error(&mut self, error: &str) {
        self.span
            .set_status(opentelemetry::trace::Status::error(error.to_string()));
        self.span
            .set_attribute(KeyValue::new("error.message", error.to_string()));
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// End the span. Consumes the handle, so a span ends exactly once.
    pub fn finish(mut self) {
        self.span.end();
    }

    /// End the span with an error status
    pub fn finish_with_error(mut self, error: &str) {
        self.set_error(error);
        self.span.end();
    }

    fn context_within(&self, base: &Context) -> Context {
        base.with_remote_span_context(self.span.span_context().clone())
    }
}

/// Start a span linked to a span from another trace, for queue-based workers
/// continuing work whose originating request has already returned.
///
/// `trace_id` and `parent_span_id` are the hex-encoded W3C identifiers the
/// producer stored alongside the work item. When either is empty or invalid
/// the span starts unlinked rather than failing — the work still gets traced,
/// just without the correlation edge.
pub fn start_linked_span(
    ctx: &Context,
    name: &str,
    trace_id: &str,
    parent_span_id: &str,
    attributes: Vec<KeyValue>,
) -> (Context, TelemetrySpan) {
    let tracer = global::tracer(TRACER_NAME);
    let mut builder = tracer
        .span_builder(name.to_string())
        .with_kind(SpanKind::Consumer)
        .with_attributes(attributes);

    match parse_link_target(trace_id, parent_span_id) {
        Some(span_context) => {
            builder = builder.with_links(vec![Link::with_context(span_context)]);
        }
        None => {
            debug!(
                trace_id = trace_id,
                parent_span_id = parent_span_id,
                "invalid link target, starting unlinked span"
            );
        }
    }

    let span = builder.start_with_context(&tracer, ctx);
    let telemetry_span = TelemetrySpan::new(span);
    let derived = telemetry_span.context_within(ctx);
    (derived, telemetry_span)
}

fn parse_link_target(trace_id: &str, span_id: &str) -> Option<SpanContext> {
    if trace_id.is_empty() || span_id.is_empty() {
        return None;
    }
    let trace_id = TraceId::from_hex(trace_id).ok()?;
    let span_id = SpanId::from_hex(span_id).ok()?;
    if trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
        return None;
    }
    Some(SpanContext::new(
        trace_id,
        span_id,
        TraceFlags::SAMPLED,
        true,
        TraceState::default(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_target_valid() {
        let span_context =
            parse_link_target("4bf92f3577b34da6a3ce929d0e0e4736", "00f067aa0ba902b7").unwrap();
        assert!(span_context.is_valid());
        assert!(span_context.is_remote());
    }

    #[test]
    fn test_parse_link_target_rejects_invalid() {
        assert!(parse_link_target("", "00f067aa0ba902b7").is_none());
        assert!(parse_link_target("4bf92f3577b34da6a3ce929d0e0e4736", "").is_none());
        assert!(parse_link_target("not-hex", "00f067aa0ba902b7").is_none());
        // All-zero ids are syntactically valid hex but semantically invalid
        assert!(
            parse_link_target("00000000000000000000000000000000", "0000000000000000").is_none()
        );
    }

    #[test]
    fn test_linked_span_degrades_gracefully() {
        let (derived, span) =
            start_linked_span(&Context::new(), "worker.consume", "bogus", "bogus", vec![]);
        // Span still exists and ends exactly once
        let _ = derived;
        span.finish();
    }

    #[test]
    fn test_span_name_formatting() {
        let config = TracingConfig::new("svc");
        assert_eq!(config.span_name(&Method::GET, "/chat"), "HTTP GET /chat");

        let custom = TracingConfig::new("svc")
            .with_span_name_formatter(|method, path| format!("{}:{}", method, path));
        assert_eq!(custom.span_name(&Method::POST, "/x"), "POST:/x");
    }

    #[test]
    fn test_excluded_paths() {
        let config = TracingConfig::new("svc").with_excluded_paths(&["/healthz", "/metrics"]);
        assert!(config.excluded_paths.iter().any(|p| p == "/healthz"));
        assert!(!config.excluded_paths.iter().any(|p| p == "/chat"));
    }

    #[test]
    fn test_inject_context_produces_parseable_headers() {
        // Without a configured propagator this may be empty; the invariant
        // is that whatever is produced round-trips through HeaderMap.
        let mut headers = http::HeaderMap::new();
        inject_context(&Context::new(), &mut headers);
        for (name, value) in &headers {
            assert!(!name.as_str().is_empty());
            assert!(value.to_str().is_ok());
        }
    }

    #[tokio::test]
    async fn test_middleware_passes_through_excluded_path() {
        use tower::ServiceExt;

        let service = tower::service_fn(|_request: Request<String>| async {
            Ok::<_, std::convert::Infallible>(Response::new("ok".to_string()))
        });
        let mut traced = TracingLayer::with_config(
            TracingConfig::new("svc").with_excluded_paths(&["/healthz"]),
        )
        .layer(service);

        let request = Request::builder()
            .method(Method::GET)
            .uri("/healthz")
            .body(String::new())
            .unwrap();
        let response = traced.ready().await.unwrap().call(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_middleware_wraps_normal_path() {
        use tower::ServiceExt;

        let service = tower::service_fn(|request: Request<String>| async move {
            assert_eq!(request.uri().path(), "/chat");
            Ok::<_, std::convert::Infallible>(Response::new("reply".to_string()))
        });
        let mut traced = TracingLayer::new("svc").layer(service);

        let request = Request::builder()
            .method(Method::POST)
            .uri("/chat")
            .header("traceparent", "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01")
            .body(String::new())
            .unwrap();
        let response = traced.ready().await.unwrap().call(request).await.unwrap();
        assert_eq!(response.status(), http::StatusCode::OK);
    }
}
