//! Unified error handling for the GoMind core.
//!
//! Errors are split along the propagation policy the framework follows:
//! telemetry-plane failures are recovered locally (the application keeps
//! running without observability), while request-plane failures (routing,
//! execution, synthesis) surface to the caller as typed errors.
//!
//! # Error Categories
//!
//! - **Input Validation** - caller-provided data is invalid
//! - **Configuration** - setup and environment issues, including provider
//!   initialization failures
//! - **Request Plane** - routing, execution, and synthesis failures raised by
//!   the orchestrator
//! - **Circuit Open** - a breaker rejected the operation
//! - **Shutdown** - partial failures aggregated during teardown
//!
//! # Quick Start
//!
//! ```rust
//! use gomind::error::GomindError;
//!
//! # fn handle(error: GomindError) {
//! match error {
//!     _ if error.is_retryable() => { /* retry with backoff */ }
//!     _ if error.is_user_error() => { /* reject the request */ }
//!     _ => { /* log and surface */ }
//! }
//! # }
//! ```

use thiserror::Error;

/// Main error type for the GoMind core
#[derive(Error, Debug, Clone)]
pub enum GomindError {
    /// Input validation errors (caller-provided data is invalid)
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    /// Configuration errors (setup, endpoints, provider construction)
    #[error("Configuration error: {message}")]
    ConfigurationError { message: String },

    /// The router could not produce a plan for a request
    #[error("Routing failed: {message}")]
    RoutingFailure { message: String },

    /// Plan execution failed in a way that cannot yield a partial response
    #[error("Execution failed: {message}")]
    ExecutionFailure { message: String },

    /// Response synthesis failed and no fallback was possible
    #[error("Synthesis failed: {message}")]
    SynthesisFailure { message: String },

    /// A circuit breaker is open and rejected the operation
    #[error("Circuit breaker open: {message}")]
    CircuitOpen { message: String },

    /// A downstream agent call failed
    #[error("Agent call failed: {message}")]
    AgentCallError { message: String },

    /// Network-related errors
    #[error("Network error: {message}")]
    NetworkError { message: String },

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {message}")]
    SerializationError { message: String },

    /// Timeout errors
    #[error("Timeout error: operation timed out after {timeout_ms}ms")]
    TimeoutError { timeout_ms: u64 },

    /// Aggregated partial failure during shutdown
    #[error("Shutdown completed with errors: {message}")]
    ShutdownPartialFailure { message: String },

    /// Internal library errors
    #[error("Internal error: {message}")]
    InternalError { message: String },
}

impl GomindError {
    /// Create a simple InvalidInput error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    /// Create a simple ConfigurationError
    pub fn configuration_error(message: impl Into<String>) -> Self {
        Self::ConfigurationError {
            message: message.into(),
        }
    }

    /// Create a RoutingFailure error
    pub fn routing_failure(message: impl Into<String>) -> Self {
        Self::RoutingFailure {
            message: message.into(),
        }
    }

    /// Create an ExecutionFailure error
    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self::ExecutionFailure {
            message: message.into(),
        }
    }

    /// Create a SynthesisFailure error
    pub fn synthesis_failure(message: impl Into<String>) -> Self {
        Self::SynthesisFailure {
            message: message.into(),
        }
    }

    /// Create a CircuitOpen error
    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::CircuitOpen {
            message: message.into(),
        }
    }

    /// Create an AgentCallError
    pub fn agent_call_error(message: impl Into<String>) -> Self {
        Self::AgentCallError {
            message: message.into(),
        }
    }

    /// Create a NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        Self::NetworkError {
            message: message.into(),
        }
    }

    /// Create a SerializationError
    pub fn serialization_error(message: impl Into<String>) -> Self {
        Self::SerializationError {
            message: message.into(),
        }
    }

    /// Create a TimeoutError
    pub fn timeout_error(timeout_ms: u64) -> Self {
        Self::TimeoutError { timeout_ms }
    }

    /// Create a ShutdownPartialFailure from collected step errors
    pub fn shutdown_partial_failure(errors: &[String]) -> Self {
        Self::ShutdownPartialFailure {
            message: errors.join("; "),
        }
    }

    /// Create an InternalError
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError {
            message: message.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GomindError::NetworkError { .. }
                | GomindError::TimeoutError { .. }
                | GomindError::AgentCallError { .. }
        )
    }

    /// Check if this error is due to caller input
    pub fn is_user_error(&self) -> bool {
        matches!(self, GomindError::InvalidInput { .. })
    }

    /// Check if this error came from an open circuit breaker
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, GomindError::CircuitOpen { .. })
    }

    /// Stable error-class label used in metrics and log fields
    pub fn class(&self) -> &'static str {
        match self {
            GomindError::InvalidInput { .. } => "invalid_input",
            GomindError::ConfigurationError { .. } => "configuration",
            GomindError::RoutingFailure { .. } => "routing_failure",
            GomindError::ExecutionFailure { .. } => "execution_failure",
            GomindError::SynthesisFailure { .. } => "synthesis_failure",
            GomindError::CircuitOpen { .. } => "circuit_open",
            GomindError::AgentCallError { .. } => "agent_call",
            GomindError::NetworkError { .. } => "network",
            GomindError::SerializationError { .. } => "serialization",
            GomindError::TimeoutError { .. } => "timeout",
            GomindError::ShutdownPartialFailure { .. } => "shutdown_partial",
            GomindError::InternalError { .. } => "internal",
        }
    }
}

/// Map JSON serialization errors to GomindError
impl From<serde_json::Error> for GomindError {
    fn from(error: serde_json::Error) -> Self {
        GomindError::serialization_error(format!("JSON serialization failed: {}", error))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = GomindError::invalid_input("test message");
        assert!(matches!(error, GomindError::InvalidInput { .. }));
        assert_eq!(error.to_string(), "Invalid input: test message");
    }

    #[test]
    fn test_error_classification() {
        let network_error = GomindError::network_error("connection refused");
        assert!(network_error.is_retryable());
        assert!(!network_error.is_user_error());

        let input_error = GomindError::invalid_input("bad request");
        assert!(!input_error.is_retryable());
        assert!(input_error.is_user_error());

        let circuit_error = GomindError::circuit_open("orchestrator circuit open");
        assert!(circuit_error.is_circuit_open());
        assert!(!circuit_error.is_retryable());
    }

    #[test]
    fn test_error_class_labels() {
        assert_eq!(GomindError::timeout_error(500).class(), "timeout");
        assert_eq!(
            GomindError::routing_failure("no plan").class(),
            "routing_failure"
        );
    }

    #[test]
    fn test_shutdown_partial_failure_joins_errors() {
        let error = GomindError::shutdown_partial_failure(&[
            "meter provider: flush failed".to_string(),
            "tracer provider: timeout".to_string(),
        ]);
        let display = error.to_string();
        assert!(display.contains("meter provider"));
        assert!(display.contains("tracer provider"));
    }

    #[test]
    fn test_serialization_error_from_conversion() {
        let json_error = serde_json::from_str::<serde_json::Value>("not json").unwrap_err();
        let error: GomindError = json_error.into();
        assert!(matches!(error, GomindError::SerializationError { .. }));
    }
}
