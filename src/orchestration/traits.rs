//! Seams to the external collaborators the orchestration core consumes.
//!
//! Routing, inter-component transport, and LLM access live outside this
//! crate. The orchestrator reaches them only through these narrow traits, so
//! a Redis-backed discovery service, an HTTP mesh, or an in-process fake all
//! plug in the same way.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use opentelemetry::Context;

use crate::error::GomindError;
use crate::orchestration::{RoutingMode, RoutingPlan};
use crate::Result;

/// A component visible in the network catalog.
#[derive(Debug, Clone)]
pub struct AgentInfo {
    pub name: String,
    pub namespace: String,
    pub capabilities: Vec<String>,
}

/// Router counters for diagnostics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouterStats {
    pub plans_produced: u64,
    pub failures: u64,
}

/// Produces a routing plan for a request.
#[async_trait]
pub trait Router: Send + Sync {
    /// Propose a plan. `metadata` carries request-scoped hints (tenant,
    /// locale) the router may use for scoring.
    async fn route(
        &self,
        ctx: &Context,
        request: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<RoutingPlan>;

    fn mode(&self) -> RoutingMode {
        RoutingMode::Autonomous
    }

    /// Update the catalog of reachable agents. Routers without a catalog
    /// ignore this.
    fn set_agent_catalog(&self, _catalog: Vec<AgentInfo>) {}

    fn stats(&self) -> RouterStats {
        RouterStats::default()
    }
}

/// Invokes agents over the network.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// Call `target` (qualified `name.namespace`) with an instruction and
    /// return its textual response.
    async fn call_agent(&self, ctx: &Context, target: &str, instruction: &str) -> Result<String>;

    /// `call_agent` bounded by `timeout`
    async fn call_agent_with_timeout(
        &self,
        ctx: &Context,
        target: &str,
        instruction: &str,
        timeout: Duration,
    ) -> Result<String> {
        match tokio::time::timeout(timeout, self.call_agent(ctx, target, instruction)).await {
            Ok(result) => result,
            Err(_) => Err(GomindError::timeout_error(timeout.as_millis() as u64)),
        }
    }

    async fn available_agents(&self, _ctx: &Context) -> Result<Vec<AgentInfo>> {
        Ok(Vec::new())
    }

    async fn ping(&self, _ctx: &Context, _target: &str) -> Result<()> {
        Ok(())
    }
}

/// Options for one LLM generation.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: Option<String>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2048,
            system_prompt: None,
        }
    }
}

/// One LLM completion.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub model: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
}

/// Stream of response chunks from a streaming generation.
pub type ResponseStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// LLM access used by routing and synthesis.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate(
        &self,
        ctx: &Context,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<LlmResponse>;

    /// Streaming variant. The default adapter yields the full completion as
    /// one chunk, so non-streaming clients satisfy the trait unchanged.
    async fn generate_stream(
        &self,
        ctx: &Context,
        prompt: &str,
        options: &GenerateOptions,
    ) -> Result<ResponseStream> {
        let response = self.generate(ctx, prompt, options).await?;
        let stream = futures::stream::once(async move { Ok(response.content) });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    struct EchoLlm;

    #[async_trait]
    impl LlmClient for EchoLlm {
        async fn generate(
            &self,
            _ctx: &Context,
            prompt: &str,
            _options: &GenerateOptions,
        ) -> Result<LlmResponse> {
            Ok(LlmResponse {
                content: format!("echo: {}", prompt),
                model: "echo-1".to_string(),
                input_tokens: 1,
                output_tokens: 1,
            })
        }
    }

    struct SlowCommunicator;

    #[async_trait]
    impl Communicator for SlowCommunicator {
        async fn call_agent(
            &self,
            _ctx: &Context,
            _target: &str,
            _instruction: &str,
        ) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok("late".to_string())
        }
    }

    #[tokio::test]
    async fn test_default_stream_adapter_yields_full_content() {
        let llm = EchoLlm;
        let mut stream = llm
            .generate_stream(&Context::new(), "hi", &GenerateOptions::default())
            .await
            .unwrap();
        let chunk = stream.next().await.unwrap().unwrap();
        assert_eq!(chunk, "echo: hi");
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_call_agent_with_timeout_expires() {
        let communicator = SlowCommunicator;
        let result = communicator
            .call_agent_with_timeout(
                &Context::new(),
                "slow.default",
                "hurry",
                Duration::from_millis(20),
            )
            .await;
        assert!(matches!(result, Err(GomindError::TimeoutError { .. })));
    }
}
