//! Build distributed networks of cooperating agents with built-in
//! observability, orchestration, and trace propagation.
//!
//! GoMind's core is three tightly-coupled subsystems:
//!
//! - **[`telemetry`]** — a process-wide observability runtime: zero-friction
//!   metric/trace emission, cardinality bounding, circuit breaking,
//!   rate-limited self-logging, and batched OTLP/HTTP export. It stays
//!   functional (as a silent no-op) when uninitialized and when the backend
//!   is down.
//! - **[`orchestration`]** — a request → routing-plan → execution →
//!   synthesis pipeline with sequential/parallel wave scheduling, per-step
//!   retry, circuit breaking, response caching, and partial-failure
//!   synthesis.
//! - **[`tracing`]** — the W3C TraceContext/Baggage propagation plane that
//!   stitches the first two together across process boundaries, including
//!   linked spans for queue-based async continuation.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use gomind::telemetry::{self, TelemetryConfig};
//! use gomind::orchestration::{Orchestrator, OrchestratorConfig};
//! # use gomind::orchestration::{Router, Communicator};
//!
//! # async fn example(router: Arc<dyn Router>, communicator: Arc<dyn Communicator>)
//! #     -> Result<(), Box<dyn std::error::Error>> {
//! telemetry::init(TelemetryConfig::production("my-agent"))?;
//!
//! let orchestrator = Orchestrator::new(OrchestratorConfig::default(), router, communicator);
//! let ctx = opentelemetry::Context::new();
//! let response = orchestrator
//!     .process_request(&ctx, "What's the weather in Paris?", HashMap::new())
//!     .await?;
//! println!("{}", response.response);
//!
//! telemetry::shutdown(std::time::Duration::from_secs(5)).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Module Organization
//!
//! - [`telemetry`] - metrics, baggage, circuit breaking, health, OTLP export
//! - [`orchestration`] - routing plans, execution, synthesis, the façade
//! - [`tracing`] - HTTP middleware, traced client, linked spans
//! - [`component`] - component identity and the framework integration shim
//! - [`error`] - error types and classification

pub mod component;
pub mod error;
pub mod orchestration;
pub mod telemetry;
pub mod tracing;

pub use component::{Component, ComponentType};
pub use error::GomindError;

pub type Result<T> = std::result::Result<T, GomindError>;
