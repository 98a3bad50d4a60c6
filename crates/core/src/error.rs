//! Error types for the Stepline domain.
//!
//! Each bounded context has its own `thiserror` enum. Nothing here fails a
//! session outright: the orchestration loop turns these into typed step
//! failures recorded in the trace.

use thiserror::Error;

use crate::step::ErrorKind;

/// Failure reported by a Retriever or ToolInvoker.
#[derive(Debug, Clone, Error)]
pub enum CollaboratorError {
    #[error("timed out after {timeout_ms}ms: {context}")]
    Timeout { context: String, timeout_ms: u64 },

    #[error("transient I/O failure: {0}")]
    Transient(String),

    #[error("collaborator failed: {0}")]
    Failed(String),

    /// The collaborator broke its own contract (e.g. it produced output it
    /// could not parse). Fails the whole session rather than the step.
    #[error("contract violated: {0}")]
    ContractViolation(String),
}

impl CollaboratorError {
    /// The step error kind this failure is recorded as.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::CollaboratorTimeout,
            Self::Transient(_) => ErrorKind::TransientIo,
            Self::Failed(_) => ErrorKind::CollaboratorFailed,
            Self::ContractViolation(_) => ErrorKind::ContractViolation,
        }
    }
}

/// The Planner could not produce a well-formed next action.
#[derive(Debug, Clone, Error)]
pub enum PlanningError {
    #[error("planner unavailable: {0}")]
    Unavailable(String),

    #[error("malformed plan: {0}")]
    Malformed(String),
}

#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name}: {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool temporarily unavailable: {tool_name}: {reason}")]
    Unavailable { tool_name: String, reason: String },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),
}

impl From<ToolError> for CollaboratorError {
    fn from(err: ToolError) -> Self {
        match err {
            ToolError::Unavailable { .. } => CollaboratorError::Transient(err.to_string()),
            other => CollaboratorError::Failed(other.to_string()),
        }
    }
}
