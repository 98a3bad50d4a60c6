//! Session: one conversation turn under orchestration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::message::{Message, SessionId};
use crate::retriever::Passage;
use crate::step::{ActionType, Step};

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Completed,
    Halted,
    Failed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Completed => "completed",
            SessionStatus::Halted => "halted",
            SessionStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State owned by the orchestration loop for the length of one request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,

    /// Submitted history, oldest first
    pub messages: Vec<Message>,

    /// Trace in execution order
    pub steps: Vec<Step>,

    pub tokens_used: u64,

    pub started_at: DateTime<Utc>,

    /// Set exactly once, when the loop stops
    pub status: Option<SessionStatus>,

    pub halt_reason: Option<String>,
}

impl Session {
    pub fn new(messages: Vec<Message>, started_at: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            messages,
            steps: Vec::new(),
            tokens_used: 0,
            started_at,
            status: None,
            halt_reason: None,
        }
    }

    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }

    /// Index the next appended step will carry.
    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Append a finished step. Its index must be the next contiguous one.
    pub fn push_step(&mut self, step: Step) {
        debug_assert_eq!(step.index, self.steps.len(), "step indices must be contiguous");
        self.steps.push(step);
    }

    pub fn add_tokens(&mut self, tokens: u64) {
        self.tokens_used = self.tokens_used.saturating_add(tokens);
    }

    /// Record the terminal status. Returns `false` (and changes nothing) if
    /// the session already finished.
    pub fn finish(&mut self, status: SessionStatus, halt_reason: Option<String>) -> bool {
        if self.status.is_some() {
            return false;
        }
        self.status = Some(status);
        self.halt_reason = halt_reason;
        true
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_some()
    }

    /// Whether any `retrieve` step has been attempted in this session.
    pub fn has_retrieve_step(&self) -> bool {
        self.steps.iter().any(|s| s.action_type == ActionType::Retrieve)
    }

    /// Whether a `retrieve` step has completed in this session.
    pub fn has_completed_retrieve(&self) -> bool {
        self.steps
            .iter()
            .any(|s| s.action_type == ActionType::Retrieve && s.is_completed())
    }

    /// All passages returned by completed `retrieve` steps, in order.
    pub fn retrieved_passages(&self) -> Vec<Passage> {
        self.steps
            .iter()
            .filter(|s| s.action_type == ActionType::Retrieve && s.is_completed())
            .filter_map(|s| s.output_data.as_ref())
            .filter_map(|out| out.get("passages"))
            .filter_map(|p| serde_json::from_value::<Vec<Passage>>(p.clone()).ok())
            .flatten()
            .collect()
    }

    /// Citation ids of all retrieved passages, deduplicated, first-seen order.
    pub fn citation_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = Vec::new();
        for passage in self.retrieved_passages() {
            if !ids.contains(&passage.citation_id) {
                ids.push(passage.citation_id);
            }
        }
        ids
    }
}
