//! Step types: the unit of orchestrated work.
//!
//! A session's trace is an ordered `Vec<Step>`. Each step has exactly one
//! action type, moves through a small status machine, and carries a
//! structured error when it fails.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The five kinds of work the orchestration loop knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Plan,
    Retrieve,
    Act,
    Verify,
    Respond,
}

impl ActionType {
    pub const ALL: [ActionType; 5] = [
        ActionType::Plan,
        ActionType::Retrieve,
        ActionType::Act,
        ActionType::Verify,
        ActionType::Respond,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Plan => "plan",
            ActionType::Retrieve => "retrieve",
            ActionType::Act => "act",
            ActionType::Verify => "verify",
            ActionType::Respond => "respond",
        }
    }

    /// Whether outputs of this action pass through the guardrail gate.
    pub fn is_gated(&self) -> bool {
        matches!(self, ActionType::Act | ActionType::Respond)
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ActionType::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown action type '{s}'"))
    }
}

/// Lifecycle of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

/// Why a step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SchemaInvalid,
    GuardrailDenied,
    CollaboratorTimeout,
    TransientIo,
    CollaboratorFailed,
    ContractViolation,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SchemaInvalid => "schema_invalid",
            ErrorKind::GuardrailDenied => "guardrail_denied",
            ErrorKind::CollaboratorTimeout => "collaborator_timeout",
            ErrorKind::TransientIo => "transient_io",
            ErrorKind::CollaboratorFailed => "collaborator_failed",
            ErrorKind::ContractViolation => "contract_violation",
        }
    }

    /// Failures that may succeed if the same input is tried again.
    pub fn is_transient(&self) -> bool {
        matches!(self, ErrorKind::CollaboratorTimeout | ErrorKind::TransientIo)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure attached to a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepError {
    pub kind: ErrorKind,
    pub message: String,

    /// Offending field path for schema failures (e.g. `args.to`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl StepError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{}: {} ({field})", self.kind, self.message),
            None => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// One unit of orchestrated work inside a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Position in the session trace, contiguous from 0
    pub index: usize,

    pub action_type: ActionType,

    pub status: StepStatus,

    /// Human-readable label shown in the widget
    pub description: String,

    /// Validated input payload
    pub input: Value,

    /// Validated output payload, `None` until the step completes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,

    /// Number of retries performed (0 on the first attempt)
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl Step {
    /// A fresh, pending step.
    pub fn new(
        index: usize,
        action_type: ActionType,
        description: impl Into<String>,
        input: Value,
    ) -> Self {
        Self {
            index,
            action_type,
            status: StepStatus::Pending,
            description: description.into(),
            input,
            output_data: None,
            attempt_count: 0,
            error: None,
        }
    }

    pub fn start(&mut self) {
        self.status = StepStatus::Running;
    }

    pub fn complete(&mut self, output: Value) {
        self.status = StepStatus::Completed;
        self.output_data = Some(output);
        self.error = None;
    }

    pub fn fail(&mut self, error: StepError) {
        self.status = StepStatus::Failed;
        self.output_data = None;
        self.error = Some(error);
    }

    /// Prepare the same step (same index, same input) for another attempt.
    pub fn prepare_retry(&mut self) {
        self.attempt_count += 1;
        self.status = StepStatus::Pending;
        self.output_data = None;
        self.error = None;
    }

    pub fn is_completed(&self) -> bool {
        self.status == StepStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }
}
