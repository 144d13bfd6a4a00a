//! Response synthesis: fold step outputs into one answer.
//!
//! Four strategies, selected in [`OrchestratorConfig`](crate::orchestration::OrchestratorConfig)
//! or defaulted per request:
//!
//! - **Llm** — asks an external model to write the answer from the step
//!   outputs. Deterministic system prompt, temperature 0.3, 1000-token cap,
//!   so identical executions synthesize near-identical responses.
//! - **Template** — named render functions; the template is picked
//!   explicitly or, as a convenience default, by request-text keywords
//!   (`analyze` → analysis, `report` → report, `summary` → summary).
//! - **Simple** — concatenates successful responses and appends failure
//!   notes. Also the universal fallback when a richer strategy errors.
//! - **Custom** — a caller-registered function. The orchestrator invokes it
//!   from concurrent requests, so it must be thread-safe.

use std::sync::Arc;

use opentelemetry::Context;
use tracing::debug;

use crate::error::GomindError;
use crate::orchestration::traits::{GenerateOptions, LlmClient};
use crate::orchestration::ExecutionResult;
use crate::Result;

const SYNTHESIS_SYSTEM_PROMPT: &str = "You are a response synthesizer for a multi-agent system. \
     Combine the agent results into a single coherent answer to the user's request. \
     Use only the information provided. When some steps failed, answer from the \
     successful ones and note what is missing.";

const SYNTHESIS_TEMPERATURE: f32 = 0.3;
const SYNTHESIS_MAX_TOKENS: u32 = 1000;

/// Synthesis strategy selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SynthesisStrategy {
    Llm,
    Template,
    #[default]
    Simple,
    Custom,
}

/// Thread-safe user-supplied synthesis function.
pub type CustomSynthesisFn =
    Arc<dyn Fn(&str, &ExecutionResult) -> Result<String> + Send + Sync>;

/// Combines per-step outputs into a response body.
pub struct ResponseSynthesizer {
    strategy: SynthesisStrategy,
    llm: Option<Arc<dyn LlmClient>>,
    custom: Option<CustomSynthesisFn>,
}

impl ResponseSynthesizer {
    pub fn new(strategy: SynthesisStrategy) -> Self {
        Self {
            strategy,
            llm: None,
            custom: None,
        }
    }

    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = Some(llm);
        self
    }

    pub fn with_custom<F>(mut self, custom: F) -> Self
    where
        F: Fn(&str, &ExecutionResult) -> Result<String> + Send + Sync + 'static,
    {
        self.custom = Some(Arc::new(custom));
        self
    }

    pub fn strategy(&self) -> SynthesisStrategy {
        self.strategy
    }

    /// Produce the response body for an execution.
    pub async fn synthesize(
        &self,
        ctx: &Context,
        request: &str,
        execution: &ExecutionResult,
    ) -> Result<String> {
        match self.strategy {
            SynthesisStrategy::Llm => self.synthesize_llm(ctx, request, execution).await,
            SynthesisStrategy::Template => Ok(render_template(request, execution)),
            SynthesisStrategy::Simple => Ok(simple_concatenation(execution)),
            SynthesisStrategy::Custom => match &self.custom {
                Some(custom) => custom(request, execution),
                None => Err(GomindError::configuration_error(
                    "custom synthesis strategy selected but no function registered",
                )),
            },
        }
    }

    async fn synthesize_llm(
        &self,
        ctx: &Context,
        request: &str,
        execution: &ExecutionResult,
    ) -> Result<String> {
        let llm = self.llm.as_ref().ok_or_else(|| {
            GomindError::configuration_error("LLM synthesis strategy selected but no client set")
        })?;

        let prompt = build_llm_prompt(request, execution);
        let options = GenerateOptions {
            temperature: SYNTHESIS_TEMPERATURE,
            max_tokens: SYNTHESIS_MAX_TOKENS,
            system_prompt: Some(SYNTHESIS_SYSTEM_PROMPT.to_string()),
        };
        let response = llm.generate(ctx, &prompt, &options).await?;
        debug!(
            model = %response.model,
            output_tokens = response.output_tokens,
            "LLM synthesis complete"
        );
        Ok(response.content)
    }
}

fn build_llm_prompt(request: &str, execution: &ExecutionResult) -> String {
    let mut prompt = format!("Original request: {}\n\n", request);

    let successes: Vec<_> = execution.successful_steps().collect();
    if !successes.is_empty() {
        prompt.push_str("Successful steps:\n");
        for step in successes {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                step.step_id, step.agent, step.response
            ));
        }
        prompt.push('\n');
    }

    let failures: Vec<_> = execution.failed_steps().collect();
    if !failures.is_empty() {
        prompt.push_str("Failed steps:\n");
        for step in failures {
            prompt.push_str(&format!(
                "- {} ({}): {}\n",
                step.step_id,
                step.agent,
                step.error.as_deref().unwrap_or("unknown error")
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str("Write the final answer for the user.");
    prompt
}

/// Pick a named template from request keywords. Explicit configuration
/// should be preferred; this heuristic is the compatibility default.
fn select_template(request: &str) -> &'static str {
    let lowered = request.to_lowercase();
    if lowered.contains("analyze") {
        "analysis"
    } else if lowered.contains("report") {
        "report"
    } else if lowered.contains("summary") {
        "summary"
    } else {
        "default"
    }
}

fn render_template(request: &str, execution: &ExecutionResult) -> String {
    let body = simple_concatenation(execution);
    match select_template(request) {
        "analysis" => format!(
            "Analysis for: {}\n\n{}\n\nSteps completed: {}/{}",
            request,
            body,
            execution.successful_steps().count(),
            execution.step_results.len()
        ),
        "report" => format!(
            "Report\n======\nRequest: {}\nOutcome: {}\n\n{}",
            request,
            if execution.success { "complete" } else { "partial" },
            body
        ),
        "summary" => format!("Summary: {}", body),
        _ => body,
    }
}

/// Concatenate successful step responses, then append failure notes. Used by
/// the Simple strategy and as the orchestrator's fallback when a richer
/// strategy fails but execution produced data.
pub fn simple_concatenation(execution: &ExecutionResult) -> String {
    let mut parts: Vec<String> = execution
        .successful_steps()
        .filter(|step| !step.response.is_empty())
        .map(|step| step.response.clone())
        .collect();

    for step in execution.failed_steps() {
        parts.push(format!(
            "[{} failed: {}]",
            step.agent,
            step.error.as_deref().unwrap_or("unknown error")
        ));
    }

    parts.join("\n\n")
}
