//! Planner trait: decides what the loop does next.
//!
//! The orchestration loop never decides what a good plan is. It asks the
//! planner for one step at a time, handing it the history and the trace so
//! far, and stops when the planner says it is done.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlanningError;
use crate::message::Message;
use crate::step::{ActionType, Step};

/// A proposed next step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub action_type: ActionType,
    pub description: String,
    pub input: Value,

    /// Tokens the planner spent producing this proposal
    #[serde(default)]
    pub tokens_used: u64,
}

impl Proposal {
    pub fn new(action_type: ActionType, description: impl Into<String>, input: Value) -> Self {
        Self {
            action_type,
            description: description.into(),
            input,
            tokens_used: 0,
        }
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }
}

/// The planner's answer to "what next?".
#[derive(Debug, Clone, PartialEq)]
pub enum Plan {
    Step(Proposal),
    Done,
}

impl Plan {
    pub fn step(action_type: ActionType, description: impl Into<String>, input: Value) -> Self {
        Plan::Step(Proposal::new(action_type, description, input))
    }
}

/// A pluggable planning strategy.
#[async_trait]
pub trait Planner: Send + Sync {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    async fn next_step(&self, history: &[Message], trace: &[Step]) -> Result<Plan, PlanningError>;
}
