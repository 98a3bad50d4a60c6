//! Structural validation of step payloads.
//!
//! Every shape is a JSON Schema document compiled once with `jsonschema`:
//! the built-in step, response and chat-request schemas at startup, tool
//! argument schemas when the tool set is attached. Nothing is ever
//! coerced; a payload either matches or the step fails with
//! `schema_invalid`.

use std::collections::HashMap;

use jsonschema::JSONSchema;
use jsonschema::error::ValidationErrorKind;
use serde_json::{Value, json};
use stepline_core::message::Role;
use stepline_core::step::ActionType;
use stepline_core::tool::ToolDefinition;
use tracing::warn;

/// A payload did not match its declared shape.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{field}: {reason}")]
pub struct SchemaError {
    /// Dotted/indexed path to the offending value, `$` for the root
    pub field: String,
    pub reason: String,
}

impl SchemaError {
    fn new(field: String, reason: impl Into<String>) -> Self {
        Self {
            field: if field.is_empty() { "$".into() } else { field },
            reason: reason.into(),
        }
    }
}

/// A compiled JSON Schema document.
///
/// A document that fails to compile is kept; every payload checked
/// against it is then rejected with the compile error.
pub struct CompiledSchema {
    validator: Result<JSONSchema, String>,
}

impl CompiledSchema {
    pub fn compile(document: &Value) -> Self {
        let validator = JSONSchema::compile(document).map_err(|e| e.to_string());
        Self { validator }
    }

    pub fn is_valid_document(&self) -> bool {
        self.validator.is_ok()
    }

    /// Check `value`, reporting the first violation found.
    pub fn validate(&self, value: &Value) -> Result<(), SchemaError> {
        let validator = match &self.validator {
            Ok(validator) => validator,
            Err(reason) => {
                return Err(SchemaError::new(String::new(), format!("schema does not compile: {reason}")));
            }
        };
        let Err(mut errors) = validator.validate(value) else {
            return Ok(());
        };
        let Some(error) = errors.next() else {
            return Ok(());
        };

        let mut field = field_path(value, &error.instance_path.to_string());
        // A missing property is reported against its parent object
        if let ValidationErrorKind::Required { property } = &error.kind
            && let Some(name) = property.as_str()
        {
            field = join(&field, name);
        }
        Err(SchemaError::new(field, error.to_string()))
    }
}

impl std::fmt::Debug for CompiledSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.validator {
            Ok(_) => f.write_str("CompiledSchema"),
            Err(reason) => write!(f, "CompiledSchema(invalid: {reason})"),
        }
    }
}

/// Turn a JSON pointer (`/messages/1/role`) into `messages[1].role`,
/// walking `instance` so array positions render as indices.
fn field_path(instance: &Value, pointer: &str) -> String {
    let mut path = String::new();
    let mut node = Some(instance);
    for raw in pointer.split('/').skip(1) {
        let segment = raw.replace("~1", "/").replace("~0", "~");
        match node {
            Some(Value::Array(items)) => {
                path.push_str(&format!("[{segment}]"));
                node = segment.parse::<usize>().ok().and_then(|i| items.get(i));
            }
            _ => {
                path = join(&path, &segment);
                node = node.and_then(|n| n.get(segment.as_str()));
            }
        }
    }
    path
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{parent}.{name}")
    }
}

// ── Building blocks ──

fn string() -> Value {
    json!({ "type": "string" })
}

fn non_empty_string() -> Value {
    json!({ "type": "string", "pattern": "\\S" })
}

fn string_list() -> Value {
    json!({ "type": "array", "items": string() })
}

/// `kind` or an explicit `null`, for optional fields.
fn nullable(kind: &str) -> Value {
    json!({ "type": [kind, "null"] })
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({ "type": "object", "properties": properties, "required": required })
}

/// Names a registered schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchemaId {
    Input(ActionType),
    Output(ActionType),
    /// `respond` output once any `retrieve` step ran: citations required
    CitedResponse,
    ChatRequest,
}

impl std::fmt::Display for SchemaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchemaId::Input(a) => write!(f, "{a}.input"),
            SchemaId::Output(a) => write!(f, "{a}.output"),
            SchemaId::CitedResponse => write!(f, "respond.cited_output"),
            SchemaId::ChatRequest => write!(f, "chat.request"),
        }
    }
}

/// Schemas by id. Built once and shared read-only.
#[derive(Debug)]
pub struct SchemaRegistry {
    schemas: HashMap<SchemaId, CompiledSchema>,
}

impl SchemaRegistry {
    /// The built-in shapes for every step kind and the chat request.
    pub fn standard() -> Self {
        Self::from_documents(standard_documents())
    }

    fn from_documents(documents: Vec<(SchemaId, Value)>) -> Self {
        let schemas = documents
            .into_iter()
            .map(|(id, document)| {
                let compiled = CompiledSchema::compile(&document);
                if !compiled.is_valid_document() {
                    warn!(schema = %id, "Built-in schema does not compile");
                }
                (id, compiled)
            })
            .collect();
        Self { schemas }
    }

    /// Validate `payload` against the schema named `id`. Unregistered ids
    /// accept everything.
    pub fn validate(&self, payload: &Value, id: SchemaId) -> Result<(), SchemaError> {
        match self.schemas.get(&id) {
            Some(schema) => schema.validate(payload),
            None => Ok(()),
        }
    }
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

fn standard_documents() -> Vec<(SchemaId, Value)> {
    let passage = object(
        json!({
            "citation_id": non_empty_string(),
            "content": string(),
            "source": string(),
            "score": { "type": "number" },
        }),
        &["citation_id", "content", "source", "score"],
    );
    let respond = object(
        json!({ "text": non_empty_string(), "citations": { "type": ["array", "null"], "items": string() } }),
        &["text"],
    );
    let message = object(
        json!({ "role": { "type": "string", "enum": Role::NAMES }, "content": string() }),
        &["role", "content"],
    );

    vec![
        (SchemaId::Input(ActionType::Plan), json!({ "type": "object" })),
        (
            SchemaId::Output(ActionType::Plan),
            object(
                json!({
                    "summary": string(),
                    "needs_retrieval": { "type": "boolean" },
                    "required_tools": string_list(),
                }),
                &["summary", "needs_retrieval", "required_tools"],
            ),
        ),
        (
            SchemaId::Input(ActionType::Retrieve),
            object(
                json!({
                    "query": non_empty_string(),
                    "filters": nullable("object"),
                    "limit": nullable("integer"),
                }),
                &["query"],
            ),
        ),
        (
            SchemaId::Output(ActionType::Retrieve),
            object(
                json!({ "query": string(), "passages": { "type": "array", "items": passage } }),
                &["query", "passages"],
            ),
        ),
        (
            SchemaId::Input(ActionType::Act),
            object(
                json!({ "tool_name": non_empty_string(), "args": { "type": "object" } }),
                &["tool_name", "args"],
            ),
        ),
        (
            SchemaId::Output(ActionType::Act),
            object(json!({ "tool_name": non_empty_string() }), &["tool_name", "result"]),
        ),
        (
            SchemaId::Input(ActionType::Verify),
            object(
                json!({ "draft": string(), "citations": { "type": ["array", "null"], "items": string() } }),
                &["draft"],
            ),
        ),
        (
            SchemaId::Output(ActionType::Verify),
            object(
                json!({ "verdict": { "enum": ["allow", "deny"] }, "reason": nullable("string") }),
                &["verdict"],
            ),
        ),
        (SchemaId::Input(ActionType::Respond), respond.clone()),
        (SchemaId::Output(ActionType::Respond), respond),
        (
            SchemaId::CitedResponse,
            object(
                json!({ "text": non_empty_string(), "citations": string_list() }),
                &["text", "citations"],
            ),
        ),
        (
            SchemaId::ChatRequest,
            object(
                json!({ "messages": { "type": "array", "items": message, "minItems": 1 } }),
                &["messages"],
            ),
        ),
    ]
}

/// Argument schemas of the attached tools, compiled once.
#[derive(Debug, Default)]
pub struct ToolSchemas {
    schemas: HashMap<String, CompiledSchema>,
}

impl ToolSchemas {
    /// Compile the `parameters` of every definition that declares one.
    pub fn compile(definitions: &[ToolDefinition]) -> Self {
        let schemas = definitions
            .iter()
            .filter(|def| !def.parameters.is_null())
            .map(|def| {
                let compiled = CompiledSchema::compile(&def.parameters);
                if !compiled.is_valid_document() {
                    warn!(tool = %def.name, "Tool argument schema does not compile; calls will be rejected");
                }
                (def.name.clone(), compiled)
            })
            .collect();
        Self { schemas }
    }

    /// Check `args` for `tool_name`. Fields are reported under `args`.
    /// Tools without a declared schema accept any arguments.
    pub fn validate(&self, tool_name: &str, args: &Value) -> Result<(), SchemaError> {
        let Some(schema) = self.schemas.get(tool_name) else {
            return Ok(());
        };
        schema.validate(args).map_err(|e| SchemaError {
            field: if e.field == "$" { "args".to_string() } else { format!("args.{}", e.field) },
            reason: e.reason,
        })
    }
}
