//! Domain event system: decoupled observation of sessions.
//!
//! The orchestration loop publishes lifecycle events here. Logging,
//! persistence, or analytics collaborators subscribe without the loop
//! knowing they exist.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;

use crate::session::SessionStatus;
use crate::step::{ActionType, ErrorKind, StepStatus};

/// All domain events in the system.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DomainEvent {
    /// A session was initialized from a submitted history
    SessionStarted {
        session_id: String,
        message_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A step reached `completed` or `failed` (after any retries)
    StepFinished {
        session_id: String,
        index: usize,
        action_type: ActionType,
        status: StepStatus,
        attempt_count: u32,
        error_kind: Option<ErrorKind>,
        timestamp: DateTime<Utc>,
    },

    /// The guardrail gate denied or rewrote an output
    GuardrailIntervened {
        session_id: String,
        step_index: usize,
        verdict: String,
        timestamp: DateTime<Utc>,
    },

    /// The loop stopped
    SessionFinished {
        session_id: String,
        status: SessionStatus,
        halt_reason: Option<String>,
        step_count: usize,
        tokens_used: u64,
        timestamp: DateTime<Utc>,
    },
}

/// A broadcast-based event bus for domain events.
///
/// Uses `tokio::sync::broadcast` for multi-consumer pub/sub.
pub struct EventBus {
    sender: broadcast::Sender<Arc<DomainEvent>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: DomainEvent) {
        // No subscribers is fine
        let _ = self.sender.send(Arc::new(event));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<DomainEvent>> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
