//! `GuardrailPolicy` backed by the contract engine.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use stepline_config::AppConfig;
use stepline_core::guardrail::{GuardContext, GuardStage, GuardrailPolicy, GuardrailVerdict};

use crate::engine::ContractEngine;
use crate::model::{Action, Contract, ContractSet, Trigger};
use crate::parser::EvalContext;
use crate::ContractResult;

/// Maps contract verdicts onto allow / deny / modify.
///
/// - `deny` → [`GuardrailVerdict::Deny`] with the contract message
/// - `redact` → [`GuardrailVerdict::Modify`] when the output actually changed
/// - `allow` / `warn` / nothing fired → [`GuardrailVerdict::Allow`]
pub struct ContractPolicy {
    engine: Arc<ContractEngine>,
}

impl ContractPolicy {
    pub fn new(engine: Arc<ContractEngine>) -> Self {
        Self { engine }
    }

    /// Build from the `[guardrails]` presets and `[[contracts]]` tables.
    pub fn from_config(config: &AppConfig) -> ContractResult<Self> {
        let mut set = ContractSet::new();
        if config.guardrails.pii_redaction {
            set.extend(ContractSet::pii_redaction());
        }
        set.extend(ContractSet::blocked_terms(&config.guardrails.blocked_terms));
        for cc in &config.contracts {
            set.add(Contract::from(cc));
        }
        Ok(Self::new(Arc::new(ContractEngine::new(set)?)))
    }

    pub fn engine(&self) -> &Arc<ContractEngine> {
        &self.engine
    }
}

/// The text a `content` condition sees.
fn content_of(candidate: &Value, stage: GuardStage) -> Option<String> {
    let text = match stage {
        GuardStage::Respond => candidate.get("text"),
        GuardStage::Act => candidate.get("result"),
    }?;
    match text {
        Value::String(s) => Some(s.clone()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[async_trait]
impl GuardrailPolicy for ContractPolicy {
    async fn evaluate(&self, candidate: &Value, context: &GuardContext) -> GuardrailVerdict {
        let trigger = match (context.stage, &context.tool_name) {
            (GuardStage::Act, Some(name)) => Trigger::Tool(name.clone()),
            (GuardStage::Act, None) => Trigger::AnyTool,
            (GuardStage::Respond, _) => Trigger::Response,
        };
        let content = content_of(candidate, context.stage);
        let ctx = EvalContext {
            output: Some(candidate),
            args: context.tool_args.as_ref(),
            content: content.as_deref(),
            tool_name: context.tool_name.as_deref(),
            user_message: context.user_message.as_deref(),
            stage: Some(context.stage.as_str()),
        };

        let verdict = self.engine.check(&trigger, &ctx);
        match verdict.action {
            Action::Deny => GuardrailVerdict::deny(verdict.message),
            Action::Redact => {
                let replacement = self.engine.redact(&verdict, candidate);
                if &replacement == candidate {
                    GuardrailVerdict::Allow
                } else {
                    GuardrailVerdict::Modify { replacement }
                }
            }
            Action::Allow | Action::Warn => GuardrailVerdict::Allow,
        }
    }
}
