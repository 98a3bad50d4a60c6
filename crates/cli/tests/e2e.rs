//! End-to-end tests across the orchestration loop, the guardrail policy,
//! the keyword retriever and the HTTP gateway.
//!
//! Collaborators are scripted in-process; no network or model calls.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use stepline_config::AppConfig;
use stepline_core::clock::ManualClock;
use stepline_core::error::{CollaboratorError, PlanningError, ToolError};
use stepline_core::event::{DomainEvent, EventBus};
use stepline_core::message::Message;
use stepline_core::plan::{Plan, Planner};
use stepline_core::retriever::{Passage, Retriever};
use stepline_core::session::SessionStatus;
use stepline_core::step::{ActionType, ErrorKind, Step, StepStatus};
use stepline_core::tool::{Tool, ToolRegistry};
use stepline_gateway::{ChatResponse, GatewayState, build_orchestrator, build_router};
use stepline_guardrails::ContractPolicy;
use stepline_orchestrator::{Orchestrator, OrchestratorSettings, RunOutcome};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

// ── Scripted collaborators ────────────────────────────────────────────────

/// Returns the scripted plans in order, then `Done`.
struct ScriptPlanner {
    plans: Mutex<Vec<Plan>>,
}

impl ScriptPlanner {
    fn new(mut plans: Vec<Plan>) -> Self {
        plans.reverse();
        Self {
            plans: Mutex::new(plans),
        }
    }
}

#[async_trait]
impl Planner for ScriptPlanner {
    fn name(&self) -> &str {
        "script"
    }

    async fn next_step(&self, _history: &[Message], _trace: &[Step]) -> Result<Plan, PlanningError> {
        Ok(self.plans.lock().unwrap().pop().unwrap_or(Plan::Done))
    }
}

/// Proposes a fresh `plan` step forever.
struct EndlessPlanner;

#[async_trait]
impl Planner for EndlessPlanner {
    fn name(&self) -> &str {
        "endless"
    }

    async fn next_step(&self, _history: &[Message], trace: &[Step]) -> Result<Plan, PlanningError> {
        Ok(Plan::step(
            ActionType::Plan,
            format!("Think #{}", trace.len() + 1),
            json!({ "summary": format!("round {}", trace.len() + 1) }),
        ))
    }
}

/// Proposes things a planner should never propose.
struct AdversarialPlanner;

#[async_trait]
impl Planner for AdversarialPlanner {
    fn name(&self) -> &str {
        "adversarial"
    }

    async fn next_step(&self, _history: &[Message], trace: &[Step]) -> Result<Plan, PlanningError> {
        Ok(match trace.len() {
            0 => Plan::step(ActionType::Plan, "plan", json!({ "summary": 42 })),
            _ => Plan::step(ActionType::Respond, "respond", json!({ "text": "" })),
        })
    }
}

/// Times out `failures` times, then returns one passage.
struct SlowStartRetriever {
    failures: usize,
    calls: AtomicUsize,
}

impl SlowStartRetriever {
    fn new(failures: usize) -> Self {
        Self {
            failures,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Retriever for SlowStartRetriever {
    fn name(&self) -> &str {
        "slow-start"
    }

    async fn query(
        &self,
        _query: &str,
        _filters: Option<&Value>,
        _limit: usize,
    ) -> Result<Vec<Passage>, CollaboratorError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(CollaboratorError::Timeout {
                context: "knowledge store".into(),
                timeout_ms: 50,
            });
        }
        Ok(vec![Passage {
            citation_id: "kb-7".into(),
            content: "Refunds are processed within 14 days.".into(),
            source: "refund-policy".into(),
            score: 0.9,
        }])
    }
}

struct SendEmailTool {
    sent: AtomicUsize,
}

#[async_trait]
impl Tool for SendEmailTool {
    fn name(&self) -> &str {
        "send_email"
    }

    fn description(&self) -> &str {
        "Send an e-mail"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"to": {"type": "string"}, "body": {"type": "string"}},
            "required": ["to", "body"]
        })
    }

    async fn execute(&self, arguments: Value) -> Result<Value, ToolError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(json!(format!("queued mail to {}", arguments["to"].as_str().unwrap_or("?"))))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────

fn settings() -> OrchestratorSettings {
    OrchestratorSettings::default().with_retry_backoff(Duration::ZERO)
}

fn user(text: &str) -> Vec<Message> {
    vec![Message::user(text)]
}

async fn run(orchestrator: &Orchestrator, text: &str) -> RunOutcome {
    orchestrator
        .run(user(text), CancellationToken::new())
        .await
        .unwrap()
}

fn assert_contiguous(outcome: &RunOutcome) {
    for (i, step) in outcome.steps.iter().enumerate() {
        assert_eq!(step.index, i, "step indices must be contiguous");
    }
}

fn actions(outcome: &RunOutcome) -> Vec<ActionType> {
    outcome.steps.iter().map(|s| s.action_type).collect()
}

const SHOP_CONFIG: &str = r#"
[orchestrator]
retry_backoff_ms = 0

[retrieval]
default_limit = 2

[[retrieval.passages]]
id = "refunds"
source = "refund-policy"
content = "Refunds are processed within 14 days. Questions go to help@shop.example."

[[retrieval.passages]]
id = "shipping"
source = "shipping-faq"
content = "Standard shipping takes 3 to 5 business days."

[guardrails]
pii_redaction = true
blocked_terms = ["competitor"]
"#;

fn shop_config() -> AppConfig {
    let config: AppConfig = toml::from_str(SHOP_CONFIG).unwrap();
    config.validate().unwrap();
    config
}

fn chat_request(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/chat")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

// ── Scenarios ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn direct_answer_completes_in_two_steps() {
    let planner = ScriptPlanner::new(vec![
        Plan::step(ActionType::Plan, "Work it out", json!({ "summary": "arithmetic" })),
        Plan::step(ActionType::Respond, "Answer", json!({ "text": "4" })),
    ]);
    let orchestrator = Orchestrator::new(Arc::new(planner), settings());

    let outcome = run(&orchestrator, "What is 2+2?").await;
    assert_eq!(outcome.status, SessionStatus::Completed);
    assert_eq!(outcome.steps.len(), 2);
    assert_eq!(outcome.response, "4");
    assert_eq!(outcome.halt_reason, None);
    assert_contiguous(&outcome);
}

#[tokio::test]
async fn retrieval_recovers_after_two_timeouts() {
    let retriever = Arc::new(SlowStartRetriever::new(2));
    let planner = ScriptPlanner::new(vec![
        Plan::step(ActionType::Plan, "plan", json!({ "summary": "refunds" })),
        Plan::step(ActionType::Retrieve, "search", json!({ "query": "refund window" })),
        Plan::step(
            ActionType::Respond,
            "answer",
            json!({ "text": "Refunds take 14 days.", "citations": ["kb-7"] }),
        ),
    ]);
    let orchestrator = Orchestrator::new(Arc::new(planner), settings().with_max_retries(2))
        .with_retriever(retriever.clone());

    let outcome = run(&orchestrator, "How long do refunds take?").await;
    assert_eq!(outcome.status, SessionStatus::Completed);

    let retrieve = &outcome.steps[1];
    assert_eq!(retrieve.action_type, ActionType::Retrieve);
    assert_eq!(retrieve.status, StepStatus::Completed);
    assert_eq!(retrieve.attempt_count, 2);
    assert_eq!(retriever.calls.load(Ordering::SeqCst), 3);

    // verify is inserted before the reply because passages were retrieved
    assert_eq!(
        actions(&outcome),
        vec![ActionType::Plan, ActionType::Retrieve, ActionType::Verify, ActionType::Respond]
    );
    assert_eq!(outcome.steps[3].output_data.as_ref().unwrap()["citations"], json!(["kb-7"]));
    assert_contiguous(&outcome);
}

#[tokio::test]
async fn denied_tool_call_halts_the_session() {
    let config: AppConfig = toml::from_str(
        r#"
[[contracts]]
name = "no-external-mail"
trigger = "tool:send_email"
condition = 'args.to NOT ENDS_WITH "@example.com"'
message = "external recipients are not allowed"
"#,
    )
    .unwrap();
    let policy = ContractPolicy::from_config(&config).unwrap();

    let tool = Arc::new(SendEmailTool {
        sent: AtomicUsize::new(0),
    });
    let mut registry = ToolRegistry::new();
    registry.register(tool.clone());

    let planner = Arc::new(ScriptPlanner::new(vec![
        Plan::step(ActionType::Plan, "plan", json!({ "summary": "mail the customer" })),
        Plan::step(
            ActionType::Act,
            "Send the mail",
            json!({ "tool_name": "send_email", "args": {"to": "someone@elsewhere.net", "body": "hi"} }),
        ),
        Plan::step(ActionType::Respond, "answer", json!({ "text": "Mail sent." })),
    ]));
    let orchestrator = Orchestrator::new(planner, settings())
        .with_tools(Arc::new(registry))
        .with_policy(Arc::new(policy));

    let outcome = run(&orchestrator, "Email the customer").await;
    assert_eq!(outcome.status, SessionStatus::Halted);
    let reason = outcome.halt_reason.as_deref().unwrap();
    assert!(reason.contains("guardrail_denied"), "{reason}");

    // nothing runs after the denied step, and denials are not retried
    assert_eq!(outcome.steps.len(), 2);
    let act = outcome.steps.last().unwrap();
    assert_eq!(act.action_type, ActionType::Act);
    assert_eq!(act.status, StepStatus::Failed);
    assert_eq!(act.error.as_ref().unwrap().kind, ErrorKind::GuardrailDenied);
    assert_eq!(act.attempt_count, 0);
    assert_eq!(tool.sent.load(Ordering::SeqCst), 1);
    assert!(outcome.response.contains("couldn't complete"));
}

#[tokio::test]
async fn step_ceiling_stops_after_exactly_ten_steps() {
    let orchestrator = Orchestrator::new(Arc::new(EndlessPlanner), settings().with_max_steps(10));

    let outcome = run(&orchestrator, "Keep thinking").await;
    assert_eq!(outcome.status, SessionStatus::Halted);
    assert_eq!(outcome.halt_reason.as_deref(), Some("step_ceiling"));
    assert_eq!(outcome.steps.len(), 10);
    assert_contiguous(&outcome);
}

#[tokio::test]
async fn malformed_planner_output_is_contained() {
    let orchestrator = Orchestrator::new(Arc::new(AdversarialPlanner), settings());

    let outcome = run(&orchestrator, "hello").await;
    assert_ne!(outcome.status, SessionStatus::Completed);
    let first = &outcome.steps[0];
    assert_eq!(first.status, StepStatus::Failed);
    assert_eq!(first.error.as_ref().unwrap().kind, ErrorKind::SchemaInvalid);
    assert_eq!(first.attempt_count, 0);
    assert!(!outcome.response.is_empty());
}

// ── Full stack from configuration ─────────────────────────────────────────

#[tokio::test]
async fn configured_stack_retrieves_verifies_and_redacts() {
    let config = shop_config();
    let orchestrator = build_orchestrator(&config, Arc::new(EventBus::default())).unwrap();

    let outcome = run(&orchestrator, "How long do refunds take?").await;
    assert_eq!(outcome.status, SessionStatus::Completed, "{:?}", outcome.halt_reason);
    assert_eq!(
        actions(&outcome),
        vec![ActionType::Plan, ActionType::Retrieve, ActionType::Verify, ActionType::Respond]
    );

    let reply = outcome.steps.last().unwrap().output_data.as_ref().unwrap();
    assert!(reply["citations"].as_array().unwrap().contains(&json!("refunds")));

    // the PII contracts rewrite the reply before it leaves the loop
    assert!(outcome.response.contains("[refunds]"));
    assert!(outcome.response.contains("[EMAIL]"));
    assert!(!outcome.response.contains("help@shop.example"));
}

#[tokio::test]
async fn configured_blocked_term_denies_the_reply() {
    let config = shop_config();
    let planner = ScriptPlanner::new(vec![
        Plan::step(ActionType::Plan, "plan", json!({ "summary": "compare" })),
        Plan::step(ActionType::Respond, "answer", json!({ "text": "Our Competitor is cheaper." })),
    ]);
    let policy = ContractPolicy::from_config(&config).unwrap();
    let orchestrator = Orchestrator::new(Arc::new(planner), OrchestratorSettings::from_config(&config))
        .with_policy(Arc::new(policy));

    let outcome = run(&orchestrator, "Who is cheaper?").await;
    assert_eq!(outcome.status, SessionStatus::Halted);
    assert!(outcome.halt_reason.unwrap().contains("blocked term"));
    assert_eq!(outcome.steps.len(), 2);
}

#[tokio::test]
async fn identical_inputs_give_identical_traces() {
    let config = shop_config();
    let build = || {
        build_orchestrator(&config, Arc::new(EventBus::default()))
            .unwrap()
            .with_clock(Arc::new(ManualClock::at_epoch()))
    };

    let first = run(&build(), "How long does shipping take?").await;
    let second = run(&build(), "How long does shipping take?").await;

    assert_eq!(first.status, second.status);
    assert_eq!(first.response, second.response);
    assert_eq!(first.steps, second.steps);
    assert_eq!(first.tokens_used, second.tokens_used);
}

#[tokio::test]
async fn events_follow_the_session_lifecycle() {
    let bus = Arc::new(EventBus::default());
    let mut rx = bus.subscribe();
    let orchestrator = build_orchestrator(&shop_config(), bus.clone()).unwrap();

    let outcome = run(&orchestrator, "How long do refunds take?").await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(matches!(events.first().unwrap().as_ref(), DomainEvent::SessionStarted { .. }));
    let finished_steps = events
        .iter()
        .filter(|e| matches!(e.as_ref(), DomainEvent::StepFinished { .. }))
        .count();
    assert_eq!(finished_steps, outcome.steps.len());
    assert!(events
        .iter()
        .any(|e| matches!(e.as_ref(), DomainEvent::GuardrailIntervened { verdict, .. } if verdict == "modify")));
    match events.last().unwrap().as_ref() {
        DomainEvent::SessionFinished { status, step_count, .. } => {
            assert_eq!(*status, SessionStatus::Completed);
            assert_eq!(*step_count, outcome.steps.len());
        }
        other => panic!("expected SessionFinished, got {other:?}"),
    }
}

// ── Over HTTP ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn chat_endpoint_serves_the_configured_stack() {
    let config = shop_config();
    let orchestrator = build_orchestrator(&config, Arc::new(EventBus::default())).unwrap();
    let app = build_router(
        Arc::new(GatewayState {
            orchestrator: Arc::new(orchestrator),
        }),
        &config.gateway,
    );

    let response = app
        .clone()
        .oneshot(chat_request(
            r#"{"messages":[{"role":"system","content":"Be brief."},{"role":"user","content":"How long does shipping take?"}]}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let chat: ChatResponse = serde_json::from_slice(&body).unwrap();
    assert_eq!(chat.status, SessionStatus::Completed);
    assert!(chat.response.contains("[shipping]"));
    assert_eq!(chat.steps.len(), 4);
    assert!(chat.halt_reason.is_none());

    let response = app
        .oneshot(chat_request(r#"{"messages":[{"role":"wizard","content":"hi"}]}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let error: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(error["field"], "messages[0].role");
}
