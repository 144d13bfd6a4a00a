//! End-to-end orchestration pipeline tests with in-process collaborators.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use opentelemetry::Context;

use gomind::error::GomindError;
use gomind::orchestration::{
    Communicator, ExecutorConfig, GenerateOptions, LlmClient, LlmResponse, Orchestrator,
    OrchestratorConfig, Router, RoutingMode, RoutingPlan, RoutingStep, SynthesisStrategy,
};
use gomind::Result;

struct ScriptedRouter {
    plan: RoutingPlan,
}

#[async_trait]
impl Router for ScriptedRouter {
    async fn route(
        &self,
        _ctx: &Context,
        _request: &str,
        _metadata: &HashMap<String, String>,
    ) -> Result<RoutingPlan> {
        Ok(self.plan.clone())
    }

    fn mode(&self) -> RoutingMode {
        self.plan.mode
    }
}

struct ScriptedCommunicator {
    responses: HashMap<String, Result<String>>,
}

#[async_trait]
impl Communicator for ScriptedCommunicator {
    async fn call_agent(&self, _ctx: &Context, target: &str, _instruction: &str) -> Result<String> {
        match self.responses.get(target) {
            Some(Ok(response)) => Ok(response.clone()),
            Some(Err(error)) => Err(error.clone()),
            None => Err(GomindError::agent_call_error(format!(
                "unknown target {}",
                target
            ))),
        }
    }
}

/// Concatenating fake model: the "synthesis" is the step outputs joined, so
/// assertions can check what reached the model.
struct JoiningLlm;

#[async_trait]
impl LlmClient for JoiningLlm {
    async fn generate(
        &self,
        _ctx: &Context,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse> {
        assert!((options.temperature - 0.3).abs() < f32::EPSILON);
        assert_eq!(options.max_tokens, 1000);
        Ok(LlmResponse {
            content: format!("Synthesized from:\n{}", prompt),
            model: "joining-1".to_string(),
            input_tokens: prompt.len() as u32,
            output_tokens: 42,
        })
    }
}

fn parallel_plan() -> RoutingPlan {
    RoutingPlan::new(
        "plan-parallel",
        vec![
            RoutingStep::new(1, "step-1", "agent1")
                .with_instruction("Do task 1")
                .parallel(),
            RoutingStep::new(1, "step-2", "agent2")
                .with_instruction("Do task 2")
                .parallel(),
        ],
    )
}

fn quick_executor() -> ExecutorConfig {
    ExecutorConfig {
        retry_attempts: 2,
        retry_delay: Duration::from_millis(2),
        step_timeout: Duration::from_secs(5),
        total_timeout: Duration::from_secs(30),
        max_concurrency: 4,
    }
}

#[tokio::test]
async fn parallel_agents_synthesized_through_llm() {
    let mut responses = HashMap::new();
    responses.insert("agent1.default".to_string(), Ok("Result 1".to_string()));
    responses.insert("agent2.default".to_string(), Ok("Result 2".to_string()));

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            executor: quick_executor(),
            synthesis: SynthesisStrategy::Llm,
            ..OrchestratorConfig::default()
        },
        Arc::new(ScriptedRouter {
            plan: parallel_plan(),
        }),
        Arc::new(ScriptedCommunicator { responses }),
    )
    .with_llm(Arc::new(JoiningLlm));

    let response = orchestrator
        .process_request(&Context::new(), "run both tasks", HashMap::new())
        .await
        .expect("pipeline should succeed");

    // The synthesized body carries both step outputs
    assert!(response.response.contains("Result 1"));
    assert!(response.response.contains("Result 2"));
    assert_eq!(
        response.agents_involved,
        vec!["agent1.default".to_string(), "agent2.default".to_string()]
    );
    assert!(response.errors.is_empty());
    assert!(!response.request_id.is_empty());
}

#[tokio::test]
async fn required_step_failure_yields_partial_response() {
    let mut responses = HashMap::new();
    responses.insert("agent1.default".to_string(), Ok("Result 1".to_string()));
    responses.insert(
        "agent2.default".to_string(),
        Err(GomindError::network_error("agent2 unreachable")),
    );

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            executor: quick_executor(),
            synthesis: SynthesisStrategy::Simple,
            enable_cache: false,
            ..OrchestratorConfig::default()
        },
        Arc::new(ScriptedRouter {
            plan: parallel_plan(),
        }),
        Arc::new(ScriptedCommunicator { responses }),
    );

    let response = orchestrator
        .process_request(&Context::new(), "run both tasks", HashMap::new())
        .await
        .expect("partial failure still yields a response");

    assert!(response.response.contains("Result 1"));
    assert!(!response.errors.is_empty());
    assert!(response.errors.iter().any(|error| error.contains("step-2")));
    assert!(response
        .errors
        .iter()
        .any(|error| error.contains("agent2 unreachable")));
}

#[tokio::test]
async fn workflow_mode_propagates_to_response() {
    let mut plan = parallel_plan();
    plan.mode = RoutingMode::Workflow;
    plan.confidence = 0.85;

    let mut responses = HashMap::new();
    responses.insert("agent1.default".to_string(), Ok("A".to_string()));
    responses.insert("agent2.default".to_string(), Ok("B".to_string()));

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            executor: quick_executor(),
            enable_cache: false,
            ..OrchestratorConfig::default()
        },
        Arc::new(ScriptedRouter { plan }),
        Arc::new(ScriptedCommunicator { responses }),
    );

    let response = orchestrator
        .process_request(&Context::new(), "follow the workflow", HashMap::new())
        .await
        .unwrap();

    assert_eq!(response.mode, RoutingMode::Workflow);
    assert!((response.confidence - 0.85).abs() < f64::EPSILON);
}

#[tokio::test]
async fn dependent_wave_runs_after_producer() {
    let plan = RoutingPlan::new(
        "plan-deps",
        vec![
            RoutingStep::new(1, "fetch", "source").with_instruction("fetch data"),
            RoutingStep::new(2, "process", "sink")
                .with_instruction("process data")
                .depends_on(&[1]),
        ],
    );

    let mut responses = HashMap::new();
    responses.insert("source.default".to_string(), Ok("raw data".to_string()));
    responses.insert("sink.default".to_string(), Ok("processed".to_string()));

    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            executor: quick_executor(),
            enable_cache: false,
            ..OrchestratorConfig::default()
        },
        Arc::new(ScriptedRouter { plan }),
        Arc::new(ScriptedCommunicator { responses }),
    );

    let response = orchestrator
        .process_request(&Context::new(), "fetch then process", HashMap::new())
        .await
        .unwrap();

    assert!(response.errors.is_empty());
    assert_eq!(
        response.agents_involved,
        vec!["source.default".to_string(), "sink.default".to_string()]
    );
}

#[tokio::test]
async fn retried_step_recovers_within_pipeline() {
    struct FlakyOnce {
        failed: std::sync::Mutex<bool>,
    }

    #[async_trait]
    impl Communicator for FlakyOnce {
        async fn call_agent(
            &self,
            _ctx: &Context,
            _target: &str,
            _instruction: &str,
        ) -> Result<String> {
            let mut failed = self.failed.lock().unwrap();
            if !*failed {
                *failed = true;
                return Err(GomindError::network_error("transient"));
            }
            Ok("recovered".to_string())
        }
    }

    let plan = RoutingPlan::new(
        "plan-flaky",
        vec![RoutingStep::new(1, "only", "flaky")],
    );
    let orchestrator = Orchestrator::new(
        OrchestratorConfig {
            executor: quick_executor(),
            enable_cache: false,
            ..OrchestratorConfig::default()
        },
        Arc::new(ScriptedRouter { plan }),
        Arc::new(FlakyOnce {
            failed: std::sync::Mutex::new(false),
        }),
    );

    let response = orchestrator
        .process_request(&Context::new(), "survive one failure", HashMap::new())
        .await
        .unwrap();

    assert_eq!(response.response, "recovered");
    assert!(response.errors.is_empty());
}
