//! The Stepline orchestration loop.
//!
//! One user message becomes a bounded sequence of typed steps:
//!
//! 1. **Plan** what the request needs
//! 2. **Retrieve** passages from the knowledge store
//! 3. **Act** through tools, each result checked by the guardrail gate
//! 4. **Verify** the draft against what was retrieved
//! 5. **Respond** with a reply the gate has accepted
//!
//! The planner decides the order; the loop enforces schemas, retries
//! transient failures, and halts deterministically on the step ceiling, the
//! time budget, non-progress, or a final failure.

pub mod executor;
pub mod gate;
pub mod halting;
pub mod loop_runner;
pub mod planner;
pub mod retry;
pub mod schema;
pub mod settings;

#[cfg(test)]
mod test_helpers;

pub use executor::StepExecutor;
pub use gate::GuardrailGate;
pub use halting::{HaltDecision, HaltReason, HaltingController};
pub use loop_runner::{Orchestrator, RunOutcome};
pub use planner::PipelinePlanner;
pub use retry::{RetryDecision, RetryPolicy};
pub use schema::{CompiledSchema, SchemaError, SchemaId, SchemaRegistry, ToolSchemas};
pub use settings::OrchestratorSettings;

/// Why a session could not be started.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    /// The request does not match the chat request schema
    #[error("invalid request: {0}")]
    InvalidInput(#[from] SchemaError),

    /// The request matched the schema but could not be decoded
    #[error("malformed request: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl OrchestrationError {
    /// Path of the offending field, when known.
    pub fn field(&self) -> Option<&str> {
        match self {
            OrchestrationError::InvalidInput(e) => Some(&e.field),
            OrchestrationError::Malformed(_) => None,
        }
    }
}
