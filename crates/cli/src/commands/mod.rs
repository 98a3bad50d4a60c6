pub mod config_cmd;
pub mod run;
pub mod serve;

use std::sync::Arc;

use stepline_core::event::{DomainEvent, EventBus};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Log every domain event until the bus is dropped.
pub fn spawn_event_logger(bus: &Arc<EventBus>) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Event logger fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &DomainEvent) {
    match event {
        DomainEvent::SessionStarted {
            session_id,
            message_count,
            ..
        } => debug!(session_id = %session_id, messages = message_count, "event: session started"),
        DomainEvent::StepFinished {
            session_id,
            index,
            action_type,
            status,
            attempt_count,
            error_kind,
            ..
        } => debug!(
            session_id = %session_id,
            step = index,
            action = %action_type,
            status = ?status,
            attempts = attempt_count + 1,
            error = ?error_kind,
            "event: step finished"
        ),
        DomainEvent::GuardrailIntervened {
            session_id,
            step_index,
            verdict,
            ..
        } => info!(session_id = %session_id, step = step_index, verdict = %verdict, "event: guardrail intervened"),
        DomainEvent::SessionFinished {
            session_id,
            status,
            halt_reason,
            step_count,
            tokens_used,
            ..
        } => info!(
            session_id = %session_id,
            status = %status,
            halt_reason = halt_reason.as_deref().unwrap_or("-"),
            steps = step_count,
            tokens = tokens_used,
            "event: session finished"
        ),
    }
}
