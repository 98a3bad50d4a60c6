//! The guardrail checkpoint between execution and commit.
//!
//! Every `act` result and every `respond` reply passes through here before
//! its step is marked `completed`. The gate also decides when a synthetic
//! `verify` step must run ahead of a `respond`.

use std::sync::Arc;

use serde_json::{Value, json};
use stepline_core::guardrail::{GuardContext, GuardrailPolicy, GuardrailVerdict};
use stepline_core::plan::Proposal;
use stepline_core::session::Session;
use stepline_core::step::ActionType;
use tracing::{debug, warn};

pub struct GuardrailGate {
    policy: Arc<dyn GuardrailPolicy>,
    verify_citations: bool,
}

impl GuardrailGate {
    pub fn new(policy: Arc<dyn GuardrailPolicy>, verify_citations: bool) -> Self {
        Self {
            policy,
            verify_citations,
        }
    }

    /// Ask the policy about a candidate output.
    pub async fn check(&self, candidate: &Value, context: &GuardContext) -> GuardrailVerdict {
        let verdict = self.policy.evaluate(candidate, context).await;
        match &verdict {
            GuardrailVerdict::Allow => debug!(
                session_id = %context.session_id,
                step = context.step_index,
                stage = context.stage.as_str(),
                "Guardrail allowed output"
            ),
            GuardrailVerdict::Deny { reason } => warn!(
                session_id = %context.session_id,
                step = context.step_index,
                stage = context.stage.as_str(),
                reason = %reason,
                "Guardrail denied output"
            ),
            GuardrailVerdict::Modify { .. } => warn!(
                session_id = %context.session_id,
                step = context.step_index,
                stage = context.stage.as_str(),
                "Guardrail replaced output"
            ),
        }
        verdict
    }

    /// The `verify` step to run before a proposed `respond`, if any.
    ///
    /// One is built when citation checking is on, a `retrieve` step has
    /// completed, and the step just before is not already a `verify`.
    pub fn synthetic_verify(&self, session: &Session, respond_input: &Value) -> Option<Proposal> {
        if !self.verify_citations || !session.has_completed_retrieve() {
            return None;
        }
        if session
            .last_step()
            .is_some_and(|s| s.action_type == ActionType::Verify)
        {
            return None;
        }

        let draft = respond_input
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let citations = match respond_input.get("citations") {
            Some(Value::Array(ids)) => Value::Array(ids.clone()),
            _ => json!(session.citation_ids()),
        };
        Some(Proposal::new(
            ActionType::Verify,
            "Verify draft against retrieved passages",
            json!({ "draft": draft, "citations": citations }),
        ))
    }
}
