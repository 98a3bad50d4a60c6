//! Message and session identity types.
//!
//! Messages are the chat history a caller submits to `/chat`. They are plain
//! value objects: the orchestrator reads them, never mutates them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an orchestration session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The role of a message sender in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// The end user
    User,
    /// The AI assistant
    Assistant,
    /// System instructions
    System,
}

impl Role {
    /// Wire names accepted by the chat request schema.
    pub const NAMES: [&'static str; 3] = ["user", "assistant", "system"];
}

/// A single message in the submitted history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Who sent this message
    pub role: Role,

    /// The text content
    pub content: String,
}

impl Message {
    /// Create a new user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    /// Create a new assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    /// Create a new system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// The most recent user message in a history, if any.
pub fn last_user_message(history: &[Message]) -> Option<&Message> {
    history.iter().rev().find(|m| m.role == Role::User)
}

/// Rough token estimate for a history (4 chars ≈ 1 token).
pub fn estimated_tokens(history: &[Message]) -> usize {
    history.iter().map(|m| m.content.len() / 4).sum()
}
