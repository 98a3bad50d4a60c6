//! Deterministic pipeline planning strategy.
//!
//! Proposes `plan`, then `retrieve` when a retriever is available, then one
//! `act` per tool the plan requires, then `respond`. Each decision depends
//! only on the history and the trace so far, so the same inputs always
//! produce the same proposal.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use stepline_core::error::PlanningError;
use stepline_core::message::{Message, last_user_message};
use stepline_core::plan::{Plan, Planner};
use stepline_core::step::{ActionType, Step};
use stepline_core::tool::ToolDefinition;

pub struct PipelinePlanner {
    tools: Vec<ToolDefinition>,
    has_retriever: bool,
}

impl PipelinePlanner {
    pub fn new(tools: Vec<ToolDefinition>, has_retriever: bool) -> Self {
        Self {
            tools,
            has_retriever,
        }
    }

    /// Tools whose name shares a word (longer than two characters) with
    /// the user message. A tool with a required argument the planner
    /// cannot fill from text is never chosen.
    fn required_tools(&self, message: &str) -> Vec<String> {
        let words: Vec<String> = message
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| w.len() > 2)
            .map(String::from)
            .collect();
        self.tools
            .iter()
            .filter(|tool| {
                tool.name
                    .to_lowercase()
                    .split(['_', '-'])
                    .filter(|part| part.len() > 2)
                    .any(|part| words.iter().any(|w| w == part))
            })
            .filter(|tool| required_args(&tool.parameters).iter().all(|(_, text)| *text))
            .map(|tool| tool.name.clone())
            .collect()
    }

    /// Fill every required argument with the user message.
    fn arguments_for(&self, tool_name: &str, message: &str) -> Value {
        let required = self
            .tools
            .iter()
            .find(|t| t.name == tool_name)
            .map(|t| required_args(&t.parameters))
            .unwrap_or_default();
        if required.is_empty() {
            return json!({ "input": message });
        }

        let args: Map<String, Value> = required
            .into_iter()
            .map(|(name, _)| (name.to_string(), Value::String(message.to_string())))
            .collect();
        Value::Object(args)
    }
}

/// Required argument names, each paired with whether free text is a
/// valid value for it.
fn required_args(parameters: &Value) -> Vec<(&str, bool)> {
    let names = parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|r| r.iter().filter_map(Value::as_str).collect::<Vec<_>>())
        .unwrap_or_default();
    names
        .into_iter()
        .map(|name| {
            let property = parameters.get("properties").and_then(|p| p.get(name));
            (name, accepts_text(property))
        })
        .collect()
}

fn accepts_text(property: Option<&Value>) -> bool {
    let Some(property) = property else {
        return true;
    };
    if property.get("enum").is_some() || property.get("const").is_some() {
        return false;
    }
    match property.get("type") {
        None => true,
        Some(Value::String(kind)) => kind == "string",
        Some(Value::Array(kinds)) => kinds.iter().any(|k| k == "string"),
        Some(_) => false,
    }
}

fn attempted(trace: &[Step], action: ActionType) -> impl Iterator<Item = &Step> {
    trace.iter().filter(move |s| s.action_type == action)
}

/// Reply text built from what the earlier steps produced.
fn compose_reply(message: &str, trace: &[Step]) -> String {
    let mut lines = Vec::new();
    for step in trace.iter().filter(|s| s.is_completed()) {
        let Some(output) = &step.output_data else {
            continue;
        };
        match step.action_type {
            ActionType::Retrieve => {
                for passage in output["passages"].as_array().into_iter().flatten() {
                    lines.push(format!(
                        "- {} [{}]",
                        passage["content"].as_str().unwrap_or_default(),
                        passage["citation_id"].as_str().unwrap_or_default()
                    ));
                }
            }
            ActionType::Act => {
                let result = match &output["result"] {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                lines.push(format!(
                    "- {}: {}",
                    output["tool_name"].as_str().unwrap_or_default(),
                    result
                ));
            }
            ActionType::Plan | ActionType::Verify | ActionType::Respond => {}
        }
    }

    if lines.is_empty() {
        format!("I couldn't find anything relevant to \"{}\".", message.trim())
    } else {
        format!("Here is what I found:\n{}", lines.join("\n"))
    }
}

#[async_trait]
impl Planner for PipelinePlanner {
    fn name(&self) -> &str {
        "pipeline"
    }

    async fn next_step(&self, history: &[Message], trace: &[Step]) -> Result<Plan, PlanningError> {
        let Some(user) = last_user_message(history) else {
            return Err(PlanningError::Malformed(
                "history contains no user message".into(),
            ));
        };
        let message = user.content.as_str();

        if trace
            .last()
            .is_some_and(|s| s.action_type == ActionType::Respond && s.is_completed())
        {
            return Ok(Plan::Done);
        }

        let Some(plan_step) = attempted(trace, ActionType::Plan).next() else {
            let tools = self.required_tools(message);
            return Ok(Plan::step(
                ActionType::Plan,
                "Analyze the request",
                json!({
                    "summary": format!("Answer: {}", message.trim()),
                    "needs_retrieval": self.has_retriever,
                    "required_tools": tools,
                }),
            ));
        };
        let plan = plan_step.output_data.as_ref().unwrap_or(&plan_step.input);

        let needs_retrieval = plan["needs_retrieval"].as_bool().unwrap_or(false);
        if needs_retrieval && attempted(trace, ActionType::Retrieve).next().is_none() {
            return Ok(Plan::step(
                ActionType::Retrieve,
                "Search the knowledge base",
                json!({ "query": message }),
            ));
        }

        let required: Vec<&str> = plan["required_tools"]
            .as_array()
            .map(|t| t.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        for tool in required {
            let done = attempted(trace, ActionType::Act)
                .any(|s| s.input.get("tool_name").and_then(Value::as_str) == Some(tool));
            if !done {
                return Ok(Plan::step(
                    ActionType::Act,
                    format!("Run {tool}"),
                    json!({ "tool_name": tool, "args": self.arguments_for(tool, message) }),
                ));
            }
        }

        Ok(Plan::step(
            ActionType::Respond,
            "Compose the reply",
            json!({ "text": compose_reply(message, trace) }),
        ))
    }
}
