//! Deterministic termination checks.
//!
//! The controller runs twice per step: `admit` before a proposed step is
//! constructed, `after_step` once it reached `completed` or `failed`. The
//! injected `Clock` is its only time source.

use std::sync::Arc;

use stepline_core::clock::Clock;
use stepline_core::plan::Proposal;
use stepline_core::session::{Session, SessionStatus};
use stepline_core::step::{ActionType, ErrorKind};

/// Why a session stopped before a successful `respond`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    StepCeiling,
    NonProgress,
    RetriesExhausted,
    TimeBudgetExceeded,
    Cancelled,
    PlanningFailed,
    IncompleteResponse,
    /// A step failed with a kind that halts immediately
    StepFailed { kind: ErrorKind, message: String },
    VerificationDenied(String),
    ContractViolation(String),
}

impl HaltReason {
    /// Terminal status a session halted for this reason ends in.
    pub fn status(&self) -> SessionStatus {
        match self {
            HaltReason::PlanningFailed
            | HaltReason::IncompleteResponse
            | HaltReason::ContractViolation(_) => SessionStatus::Failed,
            _ => SessionStatus::Halted,
        }
    }
}

impl std::fmt::Display for HaltReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaltReason::StepCeiling => write!(f, "step_ceiling"),
            HaltReason::NonProgress => write!(f, "non_progress"),
            HaltReason::RetriesExhausted => write!(f, "retries_exhausted"),
            HaltReason::TimeBudgetExceeded => write!(f, "time_budget_exceeded"),
            HaltReason::Cancelled => write!(f, "cancelled"),
            HaltReason::PlanningFailed => write!(f, "planning_failed"),
            HaltReason::IncompleteResponse => write!(f, "incomplete_response"),
            HaltReason::StepFailed { kind, message } => write!(f, "{kind}: {message}"),
            HaltReason::VerificationDenied(reason) => write!(f, "verification_denied: {reason}"),
            HaltReason::ContractViolation(message) => write!(f, "contract_violation: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltDecision {
    Continue,
    Halt(HaltReason),
}

pub struct HaltingController {
    max_steps: usize,
    session_budget: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl HaltingController {
    pub fn new(max_steps: usize, session_budget: std::time::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_steps,
            session_budget: chrono::Duration::from_std(session_budget)
                .unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    /// Check a proposed step before it is constructed.
    pub fn admit(&self, session: &Session, proposal: &Proposal) -> HaltDecision {
        if session.steps.len() >= self.max_steps {
            return HaltDecision::Halt(HaltReason::StepCeiling);
        }
        if self.over_budget(session) {
            return HaltDecision::Halt(HaltReason::TimeBudgetExceeded);
        }
        if let Some(last) = session.last_step()
            && last.is_failed()
            && last.action_type == proposal.action_type
            && last.input == proposal.input
        {
            return HaltDecision::Halt(HaltReason::NonProgress);
        }
        HaltDecision::Continue
    }

    /// Check the session after its last step finished (retries included).
    pub fn after_step(&self, session: &Session) -> HaltDecision {
        if let Some(last) = session.last_step() {
            if let Some(error) = &last.error {
                let reason = match error.kind {
                    ErrorKind::SchemaInvalid | ErrorKind::GuardrailDenied => {
                        Some(HaltReason::StepFailed {
                            kind: error.kind,
                            message: error.message.clone(),
                        })
                    }
                    ErrorKind::CollaboratorTimeout | ErrorKind::TransientIo => {
                        Some(HaltReason::RetriesExhausted)
                    }
                    ErrorKind::ContractViolation => {
                        Some(HaltReason::ContractViolation(error.message.clone()))
                    }
                    // The planner sees the failure and may choose another step
                    ErrorKind::CollaboratorFailed => None,
                };
                if let Some(reason) = reason {
                    return HaltDecision::Halt(reason);
                }
            } else if last.action_type == ActionType::Verify
                && last.is_completed()
                && let Some(output) = &last.output_data
                && output.get("verdict").and_then(|v| v.as_str()) == Some("deny")
            {
                let reason = output
                    .get("reason")
                    .and_then(|r| r.as_str())
                    .unwrap_or("draft not supported by retrieved passages");
                return HaltDecision::Halt(HaltReason::VerificationDenied(reason.to_string()));
            }
        }
        if self.over_budget(session) {
            return HaltDecision::Halt(HaltReason::TimeBudgetExceeded);
        }
        HaltDecision::Continue
    }

    /// Whether the session has run past its wall-clock budget.
    pub fn over_budget(&self, session: &Session) -> bool {
        self.clock.now() - session.started_at > self.session_budget
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use stepline_core::clock::ManualClock;
    use stepline_core::message::Message;
    use stepline_core::step::{Step, StepError};

    fn controller(max_steps: usize) -> (HaltingController, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::at_epoch());
        (
            HaltingController::new(max_steps, Duration::from_secs(60), clock.clone()),
            clock,
        )
    }

    fn session(clock: &ManualClock) -> Session {
        Session::new(vec![Message::user("hi")], clock.now())
    }

    fn completed(index: usize, action: ActionType, output: serde_json::Value) -> Step {
        let mut s = Step::new(index, action, "step", json!({}));
        s.complete(output);
        s
    }

    fn failed(index: usize, action: ActionType, input: serde_json::Value, kind: ErrorKind) -> Step {
        let mut s = Step::new(index, action, "step", input);
        s.fail(StepError::new(kind, "boom"));
        s
    }

    #[test]
    fn ceiling_blocks_the_next_proposal() {
        let (c, clock) = controller(2);
        let mut s = session(&clock);
        let proposal = Proposal::new(ActionType::Plan, "plan", json!({}));
        assert_eq!(c.admit(&s, &proposal), HaltDecision::Continue);
        s.push_step(completed(0, ActionType::Plan, json!({})));
        s.push_step(completed(1, ActionType::Plan, json!({})));
        assert_eq!(c.admit(&s, &proposal), HaltDecision::Halt(HaltReason::StepCeiling));
    }

    #[test]
    fn repeating_a_failed_step_is_non_progress() {
        let (c, clock) = controller(10);
        let mut s = session(&clock);
        let input = json!({"tool_name": "crm", "args": {"id": 1}});
        s.push_step(failed(0, ActionType::Act, input.clone(), ErrorKind::CollaboratorFailed));

        let same = Proposal::new(ActionType::Act, "retry crm", input);
        assert_eq!(c.admit(&s, &same), HaltDecision::Halt(HaltReason::NonProgress));

        let different = Proposal::new(ActionType::Act, "crm", json!({"tool_name": "crm", "args": {"id": 2}}));
        assert_eq!(c.admit(&s, &different), HaltDecision::Continue);
    }

    #[test]
    fn time_budget_uses_injected_clock() {
        let (c, clock) = controller(10);
        let s = session(&clock);
        assert_eq!(c.after_step(&s), HaltDecision::Continue);
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(c.after_step(&s), HaltDecision::Halt(HaltReason::TimeBudgetExceeded));
        let proposal = Proposal::new(ActionType::Respond, "answer", json!({"text": "x"}));
        assert_eq!(c.admit(&s, &proposal), HaltDecision::Halt(HaltReason::TimeBudgetExceeded));
    }

    #[test]
    fn final_failures_halt_with_kind_prefix() {
        let (c, clock) = controller(10);
        let mut s = session(&clock);
        s.push_step(failed(0, ActionType::Act, json!({}), ErrorKind::GuardrailDenied));
        let HaltDecision::Halt(reason) = c.after_step(&s) else {
            panic!("expected halt");
        };
        assert_eq!(reason.to_string(), "guardrail_denied: boom");
        assert_eq!(reason.status(), SessionStatus::Halted);
    }

    #[test]
    fn exhausted_transient_failure_halts() {
        let (c, clock) = controller(10);
        let mut s = session(&clock);
        s.push_step(failed(0, ActionType::Retrieve, json!({}), ErrorKind::CollaboratorTimeout));
        assert_eq!(c.after_step(&s), HaltDecision::Halt(HaltReason::RetriesExhausted));
    }

    #[test]
    fn plain_collaborator_failure_continues() {
        let (c, clock) = controller(10);
        let mut s = session(&clock);
        s.push_step(failed(0, ActionType::Act, json!({}), ErrorKind::CollaboratorFailed));
        assert_eq!(c.after_step(&s), HaltDecision::Continue);
    }

    #[test]
    fn contract_violation_fails_session() {
        let (c, clock) = controller(10);
        let mut s = session(&clock);
        s.push_step(failed(0, ActionType::Act, json!({}), ErrorKind::ContractViolation));
        let HaltDecision::Halt(reason) = c.after_step(&s) else {
            panic!("expected halt");
        };
        assert_eq!(reason.status(), SessionStatus::Failed);
        assert_eq!(reason.to_string(), "contract_violation: boom");
    }

    #[test]
    fn verify_deny_halts() {
        let (c, clock) = controller(10);
        let mut s = session(&clock);
        s.push_step(completed(
            0,
            ActionType::Verify,
            json!({"verdict": "deny", "reason": "unknown citation 'x'"}),
        ));
        assert_eq!(
            c.after_step(&s),
            HaltDecision::Halt(HaltReason::VerificationDenied("unknown citation 'x'".into()))
        );
    }
}
