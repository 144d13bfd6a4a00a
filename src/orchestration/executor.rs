//! Plan execution with wave scheduling and bounded parallelism.
//!
//! Steps sharing an `order` value form a wave. Waves run in ascending order;
//! within a wave, steps flagged `parallel` run concurrently under a
//! semaphore of `max_concurrency` permits while the rest run sequentially in
//! plan order. A step whose dependency list names an unfinished order is
//! failed rather than deadlocked on.
//!
//! Each step runs inside a `step_timeout` envelope that wraps the whole
//! retry loop — retries never extend a step's deadline. The plan as a whole
//! is bounded by `total_timeout`; steps that never got to run are failed
//! with a timeout-class error. Step failures are captured into results, not
//! propagated: a failed required step marks the execution unsuccessful but
//! the remaining waves still run.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use opentelemetry::Context;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::orchestration::traits::Communicator;
use crate::orchestration::{ExecutionResult, RoutingPlan, RoutingStep, StepResult};
use crate::telemetry::api;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Concurrent parallel-step budget
    pub max_concurrency: usize,
    /// Deadline for one step, retries included
    pub step_timeout: Duration,
    /// Deadline for the whole plan
    pub total_timeout: Duration,
    /// Total invocation attempts per step (1 = no retry)
    pub retry_attempts: u32,
    /// Pause between attempts
    pub retry_delay: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: num_cpus::get().max(4),
            step_timeout: Duration::from_secs(30),
            total_timeout: Duration::from_secs(300),
            retry_attempts: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

/// Executes routing plans against a [`Communicator`].
pub struct PlanExecutor {
    config: ExecutorConfig,
    communicator: Arc<dyn Communicator>,
    semaphore: Arc<Semaphore>,
}

impl PlanExecutor {
    pub fn new(config: ExecutorConfig, communicator: Arc<dyn Communicator>) -> Self {
        let permits = config.max_concurrency.max(1);
        Self {
            config,
            communicator,
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Run the plan to completion (or total timeout) and report per-step
    /// outcomes. Never returns an error: failures live inside the result.
    pub async fn execute(&self, ctx: &Context, plan: &RoutingPlan) -> ExecutionResult {
        let started = Instant::now();
        let deadline = started + self.config.total_timeout;

        let mut waves: BTreeMap<u32, Vec<&RoutingStep>> = BTreeMap::new();
        for step in &plan.steps {
            waves.entry(step.order).or_default().push(step);
        }
        let plan_orders: HashSet<u32> = waves.keys().copied().collect();

        let mut completed_orders: HashSet<u32> = HashSet::new();
        let mut results: Vec<StepResult> = Vec::with_capacity(plan.steps.len());

        for (order, steps) in waves {
            if Instant::now() >= deadline {
                warn!(
                    plan_id = %plan.plan_id,
                    order = order,
                    "total timeout reached, failing remaining steps"
                );
                for step in steps {
                    results.push(timeout_result(step, self.config.total_timeout));
                }
                continue;
            }

            let (eligible, blocked): (Vec<&RoutingStep>, Vec<&RoutingStep>) =
                steps.into_iter().partition(|step| {
                    step.depends_on.iter().all(|dependency| {
                        completed_orders.contains(dependency) || !plan_orders.contains(dependency)
                    })
                });

            for step in blocked {
                warn!(
                    plan_id = %plan.plan_id,
                    step_id = %step.step_id,
                    "dependency not finished before its dependent's wave"
                );
                results.push(dependency_failure(step));
            }

            let mut handles = Vec::new();
            let mut sequential = Vec::new();
            for step in eligible {
                if step.parallel {
                    handles.push(self.spawn_step(ctx, (*step).clone()));
                } else {
                    sequential.push(step);
                }
            }

            for step in sequential {
                results.push(self.run_step(ctx, step).await);
            }
            for (step, handle) in handles {
                match handle.await {
                    Ok(result) => results.push(result),
                    Err(join_error) => {
                        results.push(panic_result(&step, &join_error.to_string()));
                    }
                }
            }

            completed_orders.insert(order);
        }

        // Report results in plan order regardless of completion order
        let mut ordered = Vec::with_capacity(results.len());
        for step in &plan.steps {
            if let Some(index) = results.iter().position(|r| r.step_id == step.step_id) {
                ordered.push(results.swap_remove(index));
            }
        }
        ordered.extend(results);

        let success = plan
            .steps
            .iter()
            .filter(|step| step.required)
            .all(|step| {
                ordered
                    .iter()
                    .any(|result| result.step_id == step.step_id && result.success)
            });

        let duration = started.elapsed();
        api::histogram(
            "gomind.executor.plan.duration",
            duration.as_secs_f64() * 1000.0,
            &[("success", if success { "true" } else { "false" })],
        );

        ExecutionResult {
            plan_id: plan.plan_id.clone(),
            success,
            step_results: ordered,
            duration,
        }
    }

    fn spawn_step(
        &self,
        ctx: &Context,
        step: RoutingStep,
    ) -> (RoutingStep, tokio::task::JoinHandle<StepResult>) {
        let communicator = self.communicator.clone();
        let config = self.config.clone();
        let semaphore = self.semaphore.clone();
        let ctx = ctx.clone();
        let task_step = step.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("executor semaphore closed");
            execute_step(communicator, &config, &ctx, &task_step).await
        });
        (step, handle)
    }

    async fn run_step(&self, ctx: &Context, step: &RoutingStep) -> StepResult {
        execute_step(self.communicator.clone(), &self.config, ctx, step).await
    }
}

async fn execute_step(
    communicator: Arc<dyn Communicator>,
    config: &ExecutorConfig,
    ctx: &Context,
    step: &RoutingStep,
) -> StepResult {
    let target = step.qualified_target();
    let started_at = Utc::now();
    let started = Instant::now();
    let attempts = Arc::new(AtomicU32::new(0));
    let attempt_budget = config.retry_attempts.max(1);

    let attempts_in_loop = attempts.clone();
    let outcome = tokio::time::timeout(config.step_timeout, async {
        loop {
            let attempt = attempts_in_loop.fetch_add(1, Ordering::SeqCst) + 1;
            match communicator
                .call_agent(ctx, &target, &step.instruction)
                .await
            {
                Ok(response) => return Ok(response),
                Err(error) => {
                    if attempt >= attempt_budget {
                        return Err(error);
                    }
                    debug!(
                        step_id = %step.step_id,
                        target = %target,
                        attempt = attempt,
                        "step attempt failed, retrying"
                    );
                    api::record_tool_call_retry(&target, attempt);
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    })
    .await;

    let duration = started.elapsed();
    let attempts = attempts.load(Ordering::SeqCst);
    let completed_at = Utc::now();

    let (success, response, error) = match outcome {
        Ok(Ok(response)) => {
            api::record_tool_call(&target);
            (true, response, None)
        }
        Ok(Err(error)) => {
            api::record_tool_call_error(&target, error.class());
            (false, String::new(), Some(error.to_string()))
        }
        Err(_) => {
            api::record_tool_call_error(&target, "timeout");
            (
                false,
                String::new(),
                Some(format!(
                    "step timed out after {}ms",
                    config.step_timeout.as_millis()
                )),
            )
        }
    };

    StepResult {
        step_id: step.step_id.clone(),
        agent: target,
        attempts: attempts.max(1),
        success,
        response,
        error,
        duration,
        started_at,
        completed_at,
    }
}

fn timeout_result(step: &RoutingStep, total_timeout: Duration) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_id: step.step_id.clone(),
        agent: step.qualified_target(),
        attempts: 0,
        success: false,
        response: String::new(),
        error: Some(format!(
            "not executed: plan exceeded total timeout of {}ms",
            total_timeout.as_millis()
        )),
        duration: Duration::ZERO,
        started_at: now,
        completed_at: now,
    }
}

fn dependency_failure(step: &RoutingStep) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_id: step.step_id.clone(),
        agent: step.qualified_target(),
        attempts: 0,
        success: false,
        response: String::new(),
        error: Some(format!(
            "dependencies {:?} not finished before wave {}",
            step.depends_on, step.order
        )),
        duration: Duration::ZERO,
        started_at: now,
        completed_at: now,
    }
}

fn panic_result(step: &RoutingStep, message: &str) -> StepResult {
    let now = Utc::now();
    StepResult {
        step_id: step.step_id.clone(),
        agent: step.qualified_target(),
        attempts: 1,
        success: false,
        response: String::new(),
        error: Some(format!("step task failed: {}", message)),
        duration: Duration::ZERO,
        started_at: now,
        completed_at: now,
    }
}
