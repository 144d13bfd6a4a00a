//! Top-level request façade: cache, circuit, routing, execution, synthesis.
//!
//! `process_request` is the pipeline the rest of the system hangs off:
//!
//! 1. response cache lookup (key = raw request text)
//! 2. circuit check — an open orchestrator circuit rejects immediately
//! 3. external router → routing plan (a router failure trips the circuit)
//! 4. plan execution under the total timeout
//! 5. synthesis, falling back to simple concatenation when the configured
//!    strategy fails but execution produced data
//! 6. response assembly, caching on success, bounded history, stats
//!
//! Latency percentiles come from a bounded sample window of recent request
//! latencies rather than a mean-derived approximation.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::Context;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::GomindError;
use crate::orchestration::executor::{ExecutorConfig, PlanExecutor};
use crate::orchestration::synthesizer::{
    simple_concatenation, ResponseSynthesizer, SynthesisStrategy,
};
use crate::orchestration::traits::{Communicator, LlmClient, Router};
use crate::orchestration::{
    default_circuit_config, CachedResponse, ExecutionRecord, ExecutionResult,
    OrchestratorResponse,
};
use crate::telemetry::api;
use crate::telemetry::circuit::{CircuitBreaker, CircuitBreakerConfig};
use crate::Result;

const CACHE_EVICTION_INTERVAL: Duration = Duration::from_secs(60);
const LATENCY_WINDOW: usize = 1024;

/// Orchestrator tuning.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub executor: ExecutorConfig,
    pub synthesis: SynthesisStrategy,
    pub enable_cache: bool,
    pub cache_ttl: Duration,
    /// Bounded execution-history ring size
    pub history_size: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            executor: ExecutorConfig::default(),
            synthesis: SynthesisStrategy::default(),
            enable_cache: true,
            cache_ttl: Duration::from_secs(300),
            history_size: 100,
            circuit_breaker: default_circuit_config(),
        }
    }
}

/// Aggregate request statistics.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub requests: u64,
    pub successes: u64,
    pub failures: u64,
    pub cache_hits: u64,
    pub cache_entries: usize,
    pub average_latency_ms: f64,
    pub p50_latency_ms: f64,
    pub p99_latency_ms: f64,
}

/// Request orchestration façade. Cheap to share behind an `Arc`; all
/// interior state is synchronized.
pub struct Orchestrator {
    config: OrchestratorConfig,
    router: Arc<dyn Router>,
    executor: PlanExecutor,
    synthesizer: ResponseSynthesizer,
    circuit: CircuitBreaker,
    cache: Arc<Mutex<HashMap<String, CachedResponse>>>,
    history: Mutex<VecDeque<ExecutionRecord>>,
    requests: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    cache_hits: AtomicU64,
    latencies: Mutex<VecDeque<f64>>,
    eviction_task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    pub fn new(
        config: OrchestratorConfig,
        router: Arc<dyn Router>,
        communicator: Arc<dyn Communicator>,
    ) -> Self {
        let executor = PlanExecutor::new(config.executor.clone(), communicator);
        let synthesizer = ResponseSynthesizer::new(config.synthesis);
        let circuit = CircuitBreaker::new("orchestrator", config.circuit_breaker.clone());
        Self {
            config,
            router,
            executor,
            synthesizer,
            circuit,
            cache: Arc::new(Mutex::new(HashMap::new())),
            history: Mutex::new(VecDeque::new()),
            requests: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::new()),
            eviction_task: Mutex::new(None),
        }
    }

    /// Attach an LLM client for the Llm synthesis strategy
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.synthesizer = ResponseSynthesizer::new(self.config.synthesis).with_llm(llm);
        self
    }

    /// Register a custom synthesis function (must be thread-safe; it runs
    /// from concurrent requests)
    pub fn with_custom_synthesis<F>(mut self, custom: F) -> Self
    where
        F: Fn(&str, &ExecutionResult) -> Result<String> + Send + Sync + 'static,
    {
        self.synthesizer = ResponseSynthesizer::new(self.config.synthesis).with_custom(custom);
        self
    }

    /// Process one request through the full pipeline.
    pub async fn process_request(
        &self,
        ctx: &Context,
        request: &str,
        metadata: HashMap<String, String>,
    ) -> Result<OrchestratorResponse> {
        let started = Instant::now();
        self.requests.fetch_add(1, Ordering::Relaxed);
        api::counter("gomind.orchestrator.requests", &[]);

        if self.config.enable_cache {
            self.ensure_eviction_task();
            if let Some(hit) = self.cache_lookup(request) {
                self.cache_hits.fetch_add(1, Ordering::Relaxed);
                api::counter("gomind.orchestrator.cache.hits", &[]);
                debug!(request = request, "response cache hit");
                return Ok(hit);
            }
        }

        if !self.circuit.allow() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            api::record_error("orchestrator", "circuit_open");
            return Err(GomindError::circuit_open(
                "orchestrator circuit is open, request rejected",
            ));
        }

        let plan = match self.router.route(ctx, request, &metadata).await {
            Ok(plan) => plan,
            Err(error) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                self.circuit.record_failure();
                api::record_error("orchestrator", "routing_failure");
                warn!(error = %error, "router failed to produce a plan");
                return Err(GomindError::routing_failure(format!(
                    "router returned no plan: {}",
                    error
                )));
            }
        };

        let execution = self.executor.execute(ctx, &plan).await;

        let response_body = match self.synthesizer.synthesize(ctx, request, &execution).await {
            Ok(body) => body,
            Err(error) => {
                if !execution.success {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    self.circuit.record_failure();
                    api::record_error("orchestrator", "synthesis_failure");
                    return Err(GomindError::synthesis_failure(format!(
                        "synthesis failed with no successful steps to fall back on: {}",
                        error
                    )));
                }
                warn!(error = %error, "synthesis failed, falling back to concatenation");
                api::record_error("orchestrator", "synthesis_fallback");
                simple_concatenation(&execution)
            }
        };

        let response = self.build_response(request, metadata, &plan.plan_id, plan.mode,
            plan.confidence, response_body, &execution, started.elapsed());

        if execution.success {
            self.circuit.record_success();
            self.successes.fetch_add(1, Ordering::Relaxed);
            api::record_success("orchestrator", "process_request");
            if self.config.enable_cache {
                self.cache_store(request, &response);
            }
        } else {
            self.failures.fetch_add(1, Ordering::Relaxed);
            api::record_error("orchestrator", "partial_failure");
        }

        self.record_history(&response, execution.success);
        self.record_latency(started.elapsed());
        api::duration("gomind.orchestrator.request.duration", started, &[]);

        Ok(response)
    }

    /// Defensive copy of the bounded execution history, newest last
    pub fn get_execution_history(&self) -> Vec<ExecutionRecord> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> OrchestratorStats {
        let latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        let mut sorted: Vec<f64> = latencies.iter().copied().collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let average = if sorted.is_empty() {
            0.0
        } else {
            sorted.iter().sum::<f64>() / sorted.len() as f64
        };

        OrchestratorStats {
            requests: self.requests.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_entries: self.cache.lock().unwrap_or_else(|e| e.into_inner()).len(),
            average_latency_ms: average,
            p50_latency_ms: percentile(&sorted, 0.50),
            p99_latency_ms: percentile(&sorted, 0.99),
        }
    }

    pub fn circuit_state(&self) -> &'static str {
        self.circuit.state()
    }

    /// Drop every cached response
    pub fn clear_cache(&self) {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Stop the background cache-eviction task. In-flight requests are
    /// cancelled by their own timeouts, not drained.
    pub fn shutdown(&self) {
        let mut task = self.eviction_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = task.take() {
            handle.abort();
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_response(
        &self,
        request: &str,
        metadata: HashMap<String, String>,
        plan_id: &str,
        mode: crate::orchestration::RoutingMode,
        confidence: f64,
        body: String,
        execution: &ExecutionResult,
        duration: Duration,
    ) -> OrchestratorResponse {
        let mut agents = Vec::new();
        for step in &execution.step_results {
            if !agents.contains(&step.agent) {
                agents.push(step.agent.clone());
            }
        }

        let errors: Vec<String> = execution
            .failed_steps()
            .map(|step| {
                format!(
                    "step {} ({}): {}",
                    step.step_id,
                    step.agent,
                    step.error.as_deref().unwrap_or("unknown error")
                )
            })
            .collect();

        debug!(
            plan_id = plan_id,
            agents = agents.len(),
            errors = errors.len(),
            "assembled orchestrator response"
        );

        OrchestratorResponse {
            request_id: uuid::Uuid::new_v4().to_string(),
            request: request.to_string(),
            response: body,
            mode,
            duration,
            agents_involved: agents,
            confidence,
            metadata,
            errors,
        }
    }

    fn cache_lookup(&self, request: &str) -> Option<OrchestratorResponse> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(request).and_then(|entry| {
            if entry.expires_at > Instant::now() {
                Some(entry.response.clone())
            } else {
                None
            }
        })
    }

    fn cache_store(&self, request: &str, response: &OrchestratorResponse) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(
            request.to_string(),
            CachedResponse {
                response: response.clone(),
                expires_at: Instant::now() + self.config.cache_ttl,
            },
        );
    }

    fn ensure_eviction_task(&self) {
        let mut task = self.eviction_task.lock().unwrap_or_else(|e| e.into_inner());
        if task.is_some() {
            return;
        }
        let cache = self.cache.clone();
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_EVICTION_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Instant::now();
                let mut cache = cache.lock().unwrap_or_else(|e| e.into_inner());
                let before = cache.len();
                cache.retain(|_, entry| entry.expires_at > now);
                if cache.len() < before {
                    debug!(evicted = before - cache.len(), "evicted expired responses");
                }
            }
        }));
    }

    fn record_history(&self, response: &OrchestratorResponse, success: bool) {
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        if history.len() >= self.config.history_size.max(1) {
            history.pop_front();
        }
        history.push_back(ExecutionRecord {
            request_id: response.request_id.clone(),
            request: response.request.clone(),
            success,
            duration: response.duration,
            agents_involved: response.agents_involved.clone(),
            completed_at: Utc::now(),
        });
    }

    fn record_latency(&self, duration: Duration) {
        let mut latencies = self.latencies.lock().unwrap_or_else(|e| e.into_inner());
        if latencies.len() >= LATENCY_WINDOW {
            latencies.pop_front();
        }
        latencies.push_back(duration.as_secs_f64() * 1000.0);
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn percentile(sorted: &[f64], quantile: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let index = ((sorted.len() as f64) * quantile) as usize;
    sorted[index.min(sorted.len() - 1)]
}
