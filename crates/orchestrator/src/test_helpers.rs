//! Scripted collaborators for orchestrator tests.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use stepline_core::error::{CollaboratorError, PlanningError};
use stepline_core::guardrail::{GuardContext, GuardrailPolicy, GuardrailVerdict};
use stepline_core::message::Message;
use stepline_core::plan::{Plan, Planner};
use stepline_core::retriever::{Passage, Retriever};
use stepline_core::step::Step;
use stepline_core::tool::{ToolDefinition, ToolInvoker};

/// A planner that returns a fixed sequence of plans, then `Done`.
pub struct ScriptedPlanner {
    plans: Mutex<Vec<Result<Plan, PlanningError>>>,
    call_count: Mutex<usize>,
}

impl ScriptedPlanner {
    pub fn new(plans: Vec<Plan>) -> Self {
        Self::with_results(plans.into_iter().map(Ok).collect())
    }

    pub fn with_results(results: Vec<Result<Plan, PlanningError>>) -> Self {
        Self {
            plans: Mutex::new(results),
            call_count: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl Planner for ScriptedPlanner {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn next_step(&self, _history: &[Message], _trace: &[Step]) -> Result<Plan, PlanningError> {
        let mut count = self.call_count.lock().unwrap();
        let plans = self.plans.lock().unwrap();
        let plan = plans.get(*count).cloned().unwrap_or(Ok(Plan::Done));
        *count += 1;
        plan
    }
}

type PlanFn = dyn Fn(&[Message], &[Step]) -> Result<Plan, PlanningError> + Send + Sync;

/// A planner driven by a closure over the trace.
pub struct FnPlanner {
    f: Box<PlanFn>,
}

impl FnPlanner {
    pub fn new(f: impl Fn(&[Message], &[Step]) -> Result<Plan, PlanningError> + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl Planner for FnPlanner {
    fn name(&self) -> &str {
        "fn"
    }

    async fn next_step(&self, history: &[Message], trace: &[Step]) -> Result<Plan, PlanningError> {
        (self.f)(history, trace)
    }
}

/// A retriever that times out a fixed number of times, then answers.
pub struct FlakyRetriever {
    failures_left: Mutex<u32>,
    delay: Option<Duration>,
    call_count: Mutex<usize>,
}

impl FlakyRetriever {
    pub fn new(failures: u32) -> Self {
        Self {
            failures_left: Mutex::new(failures),
            delay: None,
            call_count: Mutex::new(0),
        }
    }

    /// Sleep this long before every answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl Retriever for FlakyRetriever {
    fn name(&self) -> &str {
        "flaky"
    }

    async fn query(
        &self,
        _query: &str,
        _filters: Option<&Value>,
        _limit: usize,
    ) -> Result<Vec<Passage>, CollaboratorError> {
        *self.call_count.lock().unwrap() += 1;
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(CollaboratorError::Timeout {
                    context: "knowledge store".into(),
                    timeout_ms: 100,
                });
            }
        }
        Ok(vec![Passage {
            citation_id: "kb-1".into(),
            content: "Refunds are issued within 14 days of a return.".into(),
            source: "policy.md".into(),
            score: 1.3,
        }])
    }
}

/// Tool invoker with `lookup_order`, requiring a string `order_id`, and
/// `refund_order`, which also requires an integer `amount`.
pub struct StubTools {
    call_count: Mutex<usize>,
}

impl StubTools {
    pub fn new() -> Self {
        Self {
            call_count: Mutex::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        *self.call_count.lock().unwrap()
    }
}

#[async_trait]
impl ToolInvoker for StubTools {
    async fn call(
        &self,
        tool_name: &str,
        args: Value,
        _timeout: Duration,
    ) -> Result<Value, CollaboratorError> {
        *self.call_count.lock().unwrap() += 1;
        match tool_name {
            "lookup_order" => Ok(json!({
                "order_id": args["order_id"].clone(),
                "status": "shipped",
                "contact": "jane.doe@example.com"
            })),
            "refund_order" => Ok(json!({ "refunded": args["amount"].clone() })),
            other => Err(CollaboratorError::Failed(format!("tool not found: {other}"))),
        }
    }

    fn definitions(&self) -> Vec<ToolDefinition> {
        vec![
            ToolDefinition {
                name: "lookup_order".into(),
                description: "Look up an order by id".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"order_id": {"type": "string"}},
                    "required": ["order_id"]
                }),
            },
            ToolDefinition {
                name: "refund_order".into(),
                description: "Refund part of an order".into(),
                parameters: json!({
                    "type": "object",
                    "properties": {"order_id": {"type": "string"}, "amount": {"type": "integer"}},
                    "required": ["order_id", "amount"]
                }),
            },
        ]
    }
}

type PolicyFn = dyn Fn(&Value, &GuardContext) -> GuardrailVerdict + Send + Sync;

/// A guardrail policy driven by a closure.
pub struct FnPolicy {
    f: Box<PolicyFn>,
}

impl FnPolicy {
    pub fn new(f: impl Fn(&Value, &GuardContext) -> GuardrailVerdict + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }
}

#[async_trait]
impl GuardrailPolicy for FnPolicy {
    async fn evaluate(&self, candidate: &Value, context: &GuardContext) -> GuardrailVerdict {
        (self.f)(candidate, context)
    }
}
