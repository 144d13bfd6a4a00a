//! Request orchestration: routing plan → execution → synthesis.
//!
//! The orchestration core turns one natural-language request into a
//! multi-step execution across the agent network and a single synthesized
//! answer. An external [`traits::Router`] proposes a [`RoutingPlan`]; the
//! [`executor::PlanExecutor`] runs it with wave scheduling, bounded
//! parallelism, and per-step retry; the
//! [`synthesizer::ResponseSynthesizer`] folds the step outputs into one
//! response. The [`orchestrator::Orchestrator`] façade owns the response
//! cache, execution history, metrics, and circuit breaker around that
//! pipeline.
//!
//! Partial failure is the designed-for case: a plan whose optional steps
//! fail still produces a response carrying the successful outputs plus
//! human-readable error notes for the rest.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::telemetry::circuit::CircuitBreakerConfig;

pub mod executor;
pub mod orchestrator;
pub mod synthesizer;
pub mod traits;

pub use executor::{ExecutorConfig, PlanExecutor};
pub use orchestrator::{Orchestrator, OrchestratorConfig, OrchestratorStats};
pub use synthesizer::{ResponseSynthesizer, SynthesisStrategy};
pub use traits::{AgentInfo, Communicator, GenerateOptions, LlmClient, LlmResponse, Router};

/// How the plan was produced: model-driven or declarative workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Autonomous,
    Workflow,
}

impl RoutingMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingMode::Autonomous => "autonomous",
            RoutingMode::Workflow => "workflow",
        }
    }
}

/// One agent invocation within a plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingStep {
    /// Execution wave; steps sharing an order may be scheduled together
    pub order: u32,
    pub step_id: String,
    pub agent_name: String,
    /// Agent namespace, `default` when unspecified
    pub namespace: String,
    /// Instruction payload sent to the agent
    pub instruction: String,
    /// A failed required step marks the whole execution unsuccessful
    pub required: bool,
    /// Eligible for concurrent execution within its wave
    pub parallel: bool,
    /// Orders that must have finished (even unsuccessfully) first
    pub depends_on: Vec<u32>,
}

impl RoutingStep {
    pub fn new(order: u32, step_id: impl Into<String>, agent_name: impl Into<String>) -> Self {
        Self {
            order,
            step_id: step_id.into(),
            agent_name: agent_name.into(),
            namespace: "default".to_string(),
            instruction: String::new(),
            required: true,
            parallel: false,
            depends_on: Vec::new(),
        }
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn depends_on(mut self, orders: &[u32]) -> Self {
        self.depends_on = orders.to_vec();
        self
    }

    /// `name.namespace` target identifier
    pub fn qualified_target(&self) -> String {
        format!("{}.{}", self.agent_name, self.namespace)
    }
}

/// Ordered sequence of agent invocations proposed by a router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPlan {
    pub plan_id: String,
    pub mode: RoutingMode,
    /// Router confidence in [0, 1]
    pub confidence: f64,
    pub steps: Vec<RoutingStep>,
}

impl RoutingPlan {
    pub fn new(plan_id: impl Into<String>, steps: Vec<RoutingStep>) -> Self {
        Self {
            plan_id: plan_id.into(),
            mode: RoutingMode::Autonomous,
            confidence: 1.0,
            steps,
        }
    }
}

/// Outcome of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// Qualified `name.namespace` target
    pub agent: String,
    /// Invocation attempts, retries included
    pub attempts: u32,
    pub success: bool,
    pub response: String,
    pub error: Option<String>,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Outcome of a whole plan. `success` means every required step succeeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: String,
    pub success: bool,
    pub step_results: Vec<StepResult>,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn successful_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.step_results.iter().filter(|step| step.success)
    }

    pub fn failed_steps(&self) -> impl Iterator<Item = &StepResult> {
        self.step_results.iter().filter(|step| !step.success)
    }
}

/// Final answer for one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorResponse {
    pub request_id: String,
    /// Original request text
    pub request: String,
    /// Synthesized response body
    pub response: String,
    pub mode: RoutingMode,
    pub duration: Duration,
    /// Agents that participated, in `name.namespace` form, plan order
    pub agents_involved: Vec<String>,
    pub confidence: f64,
    /// Metadata propagated from the inbound request
    pub metadata: HashMap<String, String>,
    /// Human-readable notes for each failed step
    pub errors: Vec<String>,
}

/// Historical snapshot of one completed request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub request_id: String,
    pub request: String,
    pub success: bool,
    pub duration: Duration,
    pub agents_involved: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Cached response plus its absolute expiry.
#[derive(Debug, Clone)]
pub(crate) struct CachedResponse {
    pub response: OrchestratorResponse,
    pub expires_at: std::time::Instant,
}

/// Default orchestration circuit settings, shared with telemetry's breaker
/// implementation.
pub fn default_circuit_config() -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        enabled: true,
        max_failures: 5,
        recovery_time: Duration::from_secs(30),
        half_open_max: 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_builder() {
        let step = RoutingStep::new(1, "step-1", "weather")
            .with_instruction("Get the forecast")
            .with_namespace("tools")
            .parallel()
            .optional()
            .depends_on(&[0]);

        assert_eq!(step.qualified_target(), "weather.tools");
        assert!(step.parallel);
        assert!(!step.required);
        assert_eq!(step.depends_on, vec![0]);
    }

    #[test]
    fn test_default_namespace() {
        let step = RoutingStep::new(1, "step-1", "agent1");
        assert_eq!(step.qualified_target(), "agent1.default");
    }

    #[test]
    fn test_execution_result_partitions() {
        let result = ExecutionResult {
            plan_id: "p".to_string(),
            success: false,
            step_results: vec![
                StepResult {
                    step_id: "a".to_string(),
                    agent: "x.default".to_string(),
                    attempts: 1,
                    success: true,
                    response: "ok".to_string(),
                    error: None,
                    duration: Duration::from_millis(5),
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                },
                StepResult {
                    step_id: "b".to_string(),
                    agent: "y.default".to_string(),
                    attempts: 3,
                    success: false,
                    response: String::new(),
                    error: Some("boom".to_string()),
                    duration: Duration::from_millis(9),
                    started_at: Utc::now(),
                    completed_at: Utc::now(),
                },
            ],
            duration: Duration::from_millis(14),
        };

        assert_eq!(result.successful_steps().count(), 1);
        assert_eq!(result.failed_steps().count(), 1);
    }

    #[test]
    fn test_routing_mode_labels() {
        assert_eq!(RoutingMode::Autonomous.as_str(), "autonomous");
        assert_eq!(RoutingMode::Workflow.as_str(), "workflow");
    }
}
