//! Runs a single step against its collaborator.
//!
//! The executor validates the input, dispatches on the action type,
//! validates the output and, for `act` and `respond`, routes it through the
//! guardrail gate. Every failure ends up as a structured `StepError` on the
//! step; nothing escapes and nothing is retried here.

use std::time::Duration;

use serde_json::{Map, Value, json};
use stepline_core::clock::Clock;
use stepline_core::event::{DomainEvent, EventBus};
use stepline_core::guardrail::{GuardContext, GuardStage, GuardrailVerdict};
use stepline_core::message::last_user_message;
use stepline_core::retriever::Retriever;
use stepline_core::session::Session;
use stepline_core::step::{ActionType, ErrorKind, Step, StepError};
use stepline_core::tool::ToolInvoker;
use tracing::{debug, warn};

use crate::gate::GuardrailGate;
use crate::schema::{SchemaError, SchemaId, SchemaRegistry, ToolSchemas};

pub struct StepExecutor<'a> {
    pub schemas: &'a SchemaRegistry,
    pub retriever: Option<&'a dyn Retriever>,
    pub tools: &'a dyn ToolInvoker,
    pub tool_schemas: &'a ToolSchemas,
    pub gate: &'a GuardrailGate,
    pub clock: &'a dyn Clock,
    pub events: Option<&'a EventBus>,
    /// Deadline for each retriever or tool call
    pub timeout: Duration,
    pub default_limit: usize,
}

impl StepExecutor<'_> {
    /// Run `step` once. On return its status is `completed` or `failed`.
    pub async fn execute(&self, step: &mut Step, session: &Session) {
        step.start();
        debug!(
            session_id = %session.id,
            step = step.index,
            action = %step.action_type,
            attempt = step.attempt_count,
            "Executing step"
        );
        match self.run(step, session).await {
            Ok(output) => step.complete(output),
            Err(error) => {
                warn!(
                    session_id = %session.id,
                    step = step.index,
                    action = %step.action_type,
                    attempt = step.attempt_count,
                    kind = %error.kind,
                    error = %error.message,
                    "Step failed"
                );
                step.fail(error);
            }
        }
    }

    async fn run(&self, step: &Step, session: &Session) -> Result<Value, StepError> {
        validate(self.schemas, &step.input, SchemaId::Input(step.action_type))?;

        let output = match step.action_type {
            ActionType::Plan => self.plan(step),
            ActionType::Retrieve => self.retrieve(step).await?,
            ActionType::Act => self.act(step).await?,
            ActionType::Verify => self.verify(step, session),
            ActionType::Respond => self.respond(step, session),
        };

        let output_schema = output_schema(step.action_type, session);
        validate(self.schemas, &output, output_schema)?;

        let Some(stage) = guard_stage(step.action_type) else {
            return Ok(output);
        };
        let mut context = GuardContext::new(session.id.clone(), stage, step.index);
        if let Some(user) = last_user_message(&session.messages) {
            context = context.with_user_message(user.content.clone());
        }
        if stage == GuardStage::Act {
            context = context.with_tool(str_field(&step.input, "tool_name"), step.input["args"].clone());
        }

        let verdict = self.gate.check(&output, &context).await;
        if verdict != GuardrailVerdict::Allow {
            self.publish_intervention(session, step.index, verdict.label());
        }
        match verdict {
            GuardrailVerdict::Allow => Ok(output),
            GuardrailVerdict::Deny { reason } => {
                Err(StepError::new(ErrorKind::GuardrailDenied, reason))
            }
            GuardrailVerdict::Modify { replacement } => {
                validate(self.schemas, &replacement, output_schema)?;
                Ok(replacement)
            }
        }
    }

    // ── Handlers ──

    /// Record the chosen plan. No external effect.
    fn plan(&self, step: &Step) -> Value {
        let mut output = step.input.as_object().cloned().unwrap_or_default();
        output
            .entry("summary")
            .or_insert_with(|| Value::String(step.description.clone()));
        output.entry("needs_retrieval").or_insert(Value::Bool(false));
        output.entry("required_tools").or_insert_with(|| json!([]));
        Value::Object(output)
    }

    async fn retrieve(&self, step: &Step) -> Result<Value, StepError> {
        let Some(retriever) = self.retriever else {
            return Err(StepError::new(
                ErrorKind::CollaboratorFailed,
                "no retriever is configured",
            ));
        };
        let query = str_field(&step.input, "query");
        let filters = step.input.get("filters").filter(|f| !f.is_null());
        let limit = step
            .input
            .get("limit")
            .and_then(Value::as_u64)
            .map(|l| l as usize)
            .unwrap_or(self.default_limit);

        let passages = tokio::time::timeout(self.timeout, retriever.query(query, filters, limit))
            .await
            .map_err(|_| {
                timeout_error(&format!("retriever '{}'", retriever.name()), self.timeout)
            })?
            .map_err(|e| StepError::new(e.kind(), e.to_string()))?;

        let passages = serde_json::to_value(&passages).map_err(|e| {
            StepError::new(
                ErrorKind::ContractViolation,
                format!("retriever returned unserializable passages: {e}"),
            )
        })?;
        Ok(json!({ "query": query, "passages": passages }))
    }

    async fn act(&self, step: &Step) -> Result<Value, StepError> {
        let tool_name = str_field(&step.input, "tool_name");
        let args = step.input["args"].clone();

        self.tool_schemas.validate(tool_name, &args).map_err(|e| {
            debug!(tool = tool_name, field = %e.field, reason = %e.reason, "Tool arguments rejected");
            schema_error(e)
        })?;

        let result = tokio::time::timeout(self.timeout, self.tools.call(tool_name, args, self.timeout))
            .await
            .map_err(|_| timeout_error(&format!("tool '{tool_name}'"), self.timeout))?
            .map_err(|e| StepError::new(e.kind(), e.to_string()))?;

        Ok(json!({ "tool_name": tool_name, "result": result }))
    }

    /// Cross-check a draft's citations against passages retrieved so far.
    fn verify(&self, step: &Step, session: &Session) -> Value {
        let draft = str_field(&step.input, "draft");
        let cited: Vec<&str> = step
            .input
            .get("citations")
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        let known = session.citation_ids();

        let denial = if draft.trim().is_empty() {
            Some("draft is empty".to_string())
        } else if let Some(unknown) = cited.iter().find(|id| !known.iter().any(|k| k == *id)) {
            Some(format!("citation '{unknown}' does not match a retrieved passage"))
        } else if cited.is_empty() && !known.is_empty() {
            Some("draft cites none of the retrieved passages".to_string())
        } else {
            None
        };

        match denial {
            Some(reason) => json!({ "verdict": "deny", "reason": reason }),
            None => json!({ "verdict": "allow", "checked_citations": cited.len() }),
        }
    }

    fn respond(&self, step: &Step, session: &Session) -> Value {
        let citations = match step.input.get("citations") {
            Some(Value::Array(ids)) => Value::Array(ids.clone()),
            _ => json!(session.citation_ids()),
        };
        let mut output = Map::new();
        output.insert("text".into(), step.input["text"].clone());
        output.insert("citations".into(), citations);
        if let Some(tokens) = step.input.get("tokens_used") {
            output.insert("tokens_used".into(), tokens.clone());
        }
        Value::Object(output)
    }

    fn publish_intervention(&self, session: &Session, step_index: usize, verdict: &str) {
        if let Some(events) = self.events {
            events.publish(DomainEvent::GuardrailIntervened {
                session_id: session.id.to_string(),
                step_index,
                verdict: verdict.to_string(),
                timestamp: self.clock.now(),
            });
        }
    }
}

fn guard_stage(action: ActionType) -> Option<GuardStage> {
    match action {
        ActionType::Act => Some(GuardStage::Act),
        ActionType::Respond => Some(GuardStage::Respond),
        ActionType::Plan | ActionType::Retrieve | ActionType::Verify => None,
    }
}

/// `respond` output must carry citations once any retrieval was attempted.
fn output_schema(action: ActionType, session: &Session) -> SchemaId {
    if action == ActionType::Respond && session.has_retrieve_step() {
        SchemaId::CitedResponse
    } else {
        SchemaId::Output(action)
    }
}

fn validate(schemas: &SchemaRegistry, payload: &Value, id: SchemaId) -> Result<(), StepError> {
    schemas.validate(payload, id).map_err(|e| {
        debug!(schema = %id, field = %e.field, reason = %e.reason, "Schema check failed");
        schema_error(e)
    })
}

fn schema_error(e: SchemaError) -> StepError {
    StepError::new(ErrorKind::SchemaInvalid, e.reason).with_field(e.field)
}

fn timeout_error(what: &str, timeout: Duration) -> StepError {
    StepError::new(
        ErrorKind::CollaboratorTimeout,
        format!("{what} timed out after {}ms", timeout.as_millis()),
    )
}

/// A string field already checked by the input schema.
fn str_field<'v>(value: &'v Value, key: &str) -> &'v str {
    value.get(key).and_then(Value::as_str).unwrap_or_default()
}
