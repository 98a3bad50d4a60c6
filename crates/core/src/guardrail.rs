//! Guardrail policy trait and verdicts.
//!
//! Policy *content* (PII detectors, toxicity models, allowlists) lives
//! behind `GuardrailPolicy`. The orchestrator only knows the three verdicts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::SessionId;

/// Which checkpoint is asking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardStage {
    /// Output of an `act` step (a tool result)
    Act,
    /// The final reply about to be emitted
    Respond,
}

impl GuardStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardStage::Act => "act",
            GuardStage::Respond => "respond",
        }
    }
}

/// What a policy gets to see besides the candidate output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GuardContext {
    pub session_id: SessionId,
    pub stage: GuardStage,
    pub step_index: usize,

    /// Tool that produced the output, for `act`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,

    /// Arguments the tool was called with, for `act`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<Value>,

    /// The user message this session is answering
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_message: Option<String>,
}

impl GuardContext {
    pub fn new(session_id: SessionId, stage: GuardStage, step_index: usize) -> Self {
        Self {
            session_id,
            stage,
            step_index,
            tool_name: None,
            tool_args: None,
            user_message: None,
        }
    }

    pub fn with_tool(mut self, tool_name: impl Into<String>, args: Value) -> Self {
        self.tool_name = Some(tool_name.into());
        self.tool_args = Some(args);
        self
    }

    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = Some(message.into());
        self
    }
}

/// Decision on a candidate output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "lowercase")]
pub enum GuardrailVerdict {
    Allow,
    Deny { reason: String },
    Modify { replacement: Value },
}

impl GuardrailVerdict {
    pub fn deny(reason: impl Into<String>) -> Self {
        GuardrailVerdict::Deny {
            reason: reason.into(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            GuardrailVerdict::Allow => "allow",
            GuardrailVerdict::Deny { .. } => "deny",
            GuardrailVerdict::Modify { .. } => "modify",
        }
    }
}

/// Evaluates outputs at the act/respond checkpoints.
#[async_trait]
pub trait GuardrailPolicy: Send + Sync {
    async fn evaluate(&self, candidate: &Value, context: &GuardContext) -> GuardrailVerdict;
}

/// Policy that lets everything through.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

#[async_trait]
impl GuardrailPolicy for AllowAll {
    async fn evaluate(&self, _candidate: &Value, _context: &GuardContext) -> GuardrailVerdict {
        GuardrailVerdict::Allow
    }
}
