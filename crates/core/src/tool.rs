//! Tool trait and the `ToolInvoker` seam.
//!
//! The orchestration loop reaches external connectors (mail, CRM, calendar)
//! only through `ToolInvoker`. `ToolRegistry` is the in-process invoker:
//! a name → `Tool` map that enforces the per-call timeout.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{CollaboratorError, ToolError};

/// Name, description and argument schema of a tool, as listed by `/tools`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A single capability the loop can invoke from an `act` step.
#[async_trait]
pub trait Tool: Send + Sync {
    /// The unique name of this tool (e.g., "send_email").
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema describing this tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Run the tool. The result is routed through the guardrail gate.
    async fn execute(&self, arguments: Value) -> Result<Value, ToolError>;

    fn to_definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description().to_string(),
            parameters: self.parameters_schema(),
        }
    }
}

/// Invokes a named tool with a deadline.
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn call(
        &self,
        tool_name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, CollaboratorError>;

    /// Tools this invoker can reach. Each `parameters` document is the
    /// JSON Schema the loop checks `act` arguments against.
    fn definitions(&self) -> Vec<ToolDefinition> {
        Vec::new()
    }
}

/// A registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    /// List all registered tool names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ToolInvoker for ToolRegistry {
    async fn call(
        &self,
        tool_name: &str,
        args: Value,
        timeout: Duration,
    ) -> Result<Value, CollaboratorError> {
        let tool = self
            .tools
            .get(tool_name)
            .ok_or_else(|| ToolError::NotFound(tool_name.to_string()))?;

        match tokio::time::timeout(timeout, tool.execute(args)).await {
            Ok(result) => result.map_err(CollaboratorError::from),
            Err(_) => Err(CollaboratorError::Timeout {
                context: format!("tool '{tool_name}'"),
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self.tools.values().map(|t| t.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }
}
