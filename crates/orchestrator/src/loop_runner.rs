//! The orchestration loop.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};
use stepline_core::clock::{Clock, SystemClock};
use stepline_core::event::{DomainEvent, EventBus};
use stepline_core::guardrail::{AllowAll, GuardrailPolicy};
use stepline_core::message::Message;
use stepline_core::plan::{Plan, Planner, Proposal};
use stepline_core::retriever::Retriever;
use stepline_core::session::{Session, SessionStatus};
use stepline_core::step::{ActionType, Step};
use stepline_core::tool::{ToolInvoker, ToolRegistry};
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::OrchestrationError;
use crate::executor::StepExecutor;
use crate::gate::GuardrailGate;
use crate::halting::{HaltDecision, HaltReason, HaltingController};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::schema::{SchemaId, SchemaRegistry, ToolSchemas};
use crate::settings::OrchestratorSettings;

/// What a finished session hands back to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub session_id: String,
    /// Final reply text, or an apology naming the halt reason
    pub response: String,
    /// Every constructed step, in execution order
    pub steps: Vec<Step>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
    pub tokens_used: u64,
}

/// Drives one session from submitted history to a terminal status.
///
/// All collaborators are injected at construction and shared read-only
/// between sessions; each call to [`Orchestrator::run`] owns its session.
pub struct Orchestrator {
    planner: Arc<dyn Planner>,
    retriever: Option<Arc<dyn Retriever>>,
    tools: Arc<dyn ToolInvoker>,
    tool_schemas: ToolSchemas,
    policy: Arc<dyn GuardrailPolicy>,
    clock: Arc<dyn Clock>,
    event_bus: Option<Arc<EventBus>>,
    schemas: Arc<SchemaRegistry>,
    settings: OrchestratorSettings,
}

impl Orchestrator {
    /// An orchestrator with no retriever, no tools, an allow-all guardrail
    /// and the system clock.
    pub fn new(planner: Arc<dyn Planner>, settings: OrchestratorSettings) -> Self {
        Self {
            planner,
            retriever: None,
            tools: Arc::new(ToolRegistry::new()),
            tool_schemas: ToolSchemas::default(),
            policy: Arc::new(AllowAll),
            clock: Arc::new(SystemClock),
            event_bus: None,
            schemas: Arc::new(SchemaRegistry::standard()),
            settings,
        }
    }

    pub fn with_retriever(mut self, retriever: Arc<dyn Retriever>) -> Self {
        self.retriever = Some(retriever);
        self
    }

    /// Attach the tool set. Argument schemas are compiled here, once.
    pub fn with_tools(mut self, tools: Arc<dyn ToolInvoker>) -> Self {
        self.tool_schemas = ToolSchemas::compile(&tools.definitions());
        self.tools = tools;
        self
    }

    pub fn with_policy(mut self, policy: Arc<dyn GuardrailPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Publish session and step events on `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn tools(&self) -> &Arc<dyn ToolInvoker> {
        &self.tools
    }

    /// Validate a raw `/chat` request body and extract its messages.
    pub fn parse_request(&self, body: &Value) -> Result<Vec<Message>, OrchestrationError> {
        self.schemas.validate(body, SchemaId::ChatRequest)?;
        let messages = serde_json::from_value(body["messages"].clone())?;
        Ok(messages)
    }

    /// Run one session to completion.
    ///
    /// Errors only when `messages` is not a valid chat history; every
    /// failure after that is reported through the outcome's status.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, OrchestrationError> {
        self.schemas
            .validate(&json!({ "messages": messages }), SchemaId::ChatRequest)?;

        let session = Session::new(messages, self.clock.now());
        let span = info_span!("session", session_id = %session.id);
        Ok(self.drive(session, cancel).instrument(span).await)
    }

    async fn drive(&self, mut session: Session, cancel: CancellationToken) -> RunOutcome {
        info!(messages = session.messages.len(), planner = self.planner.name(), "Session started");
        self.publish(DomainEvent::SessionStarted {
            session_id: session.id.to_string(),
            message_count: session.messages.len(),
            timestamp: self.clock.now(),
        });

        let gate = GuardrailGate::new(self.policy.clone(), self.settings.verify_citations);
        let run = SessionRun {
            owner: self,
            executor: StepExecutor {
                schemas: &self.schemas,
                retriever: self.retriever.as_deref(),
                tools: self.tools.as_ref(),
                tool_schemas: &self.tool_schemas,
                gate: &gate,
                clock: self.clock.as_ref(),
                events: self.event_bus.as_deref(),
                timeout: self.settings.collaborator_timeout,
                default_limit: self.settings.default_retrieval_limit,
            },
            gate: &gate,
            halting: HaltingController::new(
                self.settings.max_steps,
                self.settings.session_budget,
                self.clock.clone(),
            ),
            retry: RetryPolicy::new(self.settings.max_retries, self.settings.retry_backoff),
            cancel: &cancel,
        };

        let halt = run.step_loop(&mut session).await;
        let (status, halt_reason) = match halt {
            None => (SessionStatus::Completed, None),
            Some(reason) => (reason.status(), Some(reason.to_string())),
        };
        session.finish(status, halt_reason.clone());

        match &halt_reason {
            None => info!(steps = session.steps.len(), tokens = session.tokens_used, "Session completed"),
            Some(reason) => warn!(
                status = %status,
                reason = %reason,
                steps = session.steps.len(),
                "Session stopped"
            ),
        }
        self.publish(DomainEvent::SessionFinished {
            session_id: session.id.to_string(),
            status,
            halt_reason: halt_reason.clone(),
            step_count: session.steps.len(),
            tokens_used: session.tokens_used,
            timestamp: self.clock.now(),
        });

        RunOutcome {
            response: response_text(&session, status, halt_reason.as_deref()),
            session_id: session.id.to_string(),
            steps: session.steps,
            status,
            halt_reason,
            tokens_used: session.tokens_used,
        }
    }

    fn publish(&self, event: DomainEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }
}

/// Per-session view over the orchestrator's collaborators.
struct SessionRun<'a> {
    owner: &'a Orchestrator,
    executor: StepExecutor<'a>,
    gate: &'a GuardrailGate,
    halting: HaltingController,
    retry: RetryPolicy,
    cancel: &'a CancellationToken,
}

impl SessionRun<'_> {
    /// Iterate until a terminal condition. `None` means completed.
    async fn step_loop(&self, session: &mut Session) -> Option<HaltReason> {
        let owner = self.owner;
        loop {
            if self.cancel.is_cancelled() {
                return Some(HaltReason::Cancelled);
            }

            let next = tokio::time::timeout(
                owner.settings.collaborator_timeout,
                owner.planner.next_step(&session.messages, &session.steps),
            )
            .await;
            let proposal = match next {
                Ok(Ok(Plan::Step(proposal))) => proposal,
                Ok(Ok(Plan::Done)) => {
                    let responded = session
                        .last_step()
                        .is_some_and(|s| s.action_type == ActionType::Respond && s.is_completed());
                    return if responded {
                        None
                    } else {
                        Some(HaltReason::IncompleteResponse)
                    };
                }
                Ok(Err(e)) => {
                    warn!(error = %e, "Planner failed");
                    return Some(HaltReason::PlanningFailed);
                }
                Err(_) => {
                    warn!(
                        timeout_ms = owner.settings.collaborator_timeout.as_millis() as u64,
                        "Planner timed out"
                    );
                    return Some(HaltReason::PlanningFailed);
                }
            };
            session.add_tokens(proposal.tokens_used);

            // The signal may have arrived while the planner was running
            if self.cancel.is_cancelled() {
                return Some(HaltReason::Cancelled);
            }

            if proposal.action_type == ActionType::Respond
                && let Some(verify) = self.gate.synthetic_verify(session, &proposal.input)
            {
                if let Some(reason) = self.admit_and_run(session, verify).await {
                    return Some(reason);
                }
                if self.cancel.is_cancelled() {
                    return Some(HaltReason::Cancelled);
                }
            }

            if let Some(reason) = self.admit_and_run(session, proposal).await {
                return Some(reason);
            }
        }
    }

    /// Admit a proposal, run it (with retries) and append it to the trace.
    async fn admit_and_run(&self, session: &mut Session, proposal: Proposal) -> Option<HaltReason> {
        if let HaltDecision::Halt(reason) = self.halting.admit(session, &proposal) {
            return Some(reason);
        }

        let mut step = Step::new(
            session.next_index(),
            proposal.action_type,
            proposal.description,
            proposal.input,
        );
        let interrupted = self.run_with_retries(&mut step, session).await;

        if let Some(tokens) = step.output_data.as_ref().map(reported_tokens) {
            session.add_tokens(tokens);
        }
        debug!(
            step = step.index,
            action = %step.action_type,
            status = ?step.status,
            attempts = step.attempt_count + 1,
            "Step finished"
        );
        self.owner.publish(DomainEvent::StepFinished {
            session_id: session.id.to_string(),
            index: step.index,
            action_type: step.action_type,
            status: step.status,
            attempt_count: step.attempt_count,
            error_kind: step.error_kind(),
            timestamp: self.owner.clock.now(),
        });
        session.push_step(step);

        if interrupted {
            return Some(HaltReason::Cancelled);
        }
        match self.halting.after_step(session) {
            HaltDecision::Continue => None,
            HaltDecision::Halt(reason) => Some(reason),
        }
    }

    /// Execute until the step completes or the retry policy gives up.
    /// Returns `true` when cancellation cut a retry short.
    async fn run_with_retries(&self, step: &mut Step, session: &Session) -> bool {
        loop {
            self.executor.execute(step, session).await;
            let Some(kind) = step.error_kind() else {
                return false;
            };
            match self.retry.should_retry(step, step.attempt_count, kind) {
                RetryDecision::GiveUp => return false,
                RetryDecision::Retry { delay } => {
                    if self.cancel.is_cancelled() {
                        return true;
                    }
                    if !delay.is_zero() {
                        tokio::select! {
                            _ = self.cancel.cancelled() => return true,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                    step.prepare_retry();
                }
            }
        }
    }
}

/// Integer `tokens_used` reported in a step output or its tool result.
fn reported_tokens(output: &Value) -> u64 {
    let direct = output.get("tokens_used").and_then(Value::as_u64).unwrap_or(0);
    let nested = output
        .get("result")
        .and_then(|r| r.get("tokens_used"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    direct.saturating_add(nested)
}

fn response_text(session: &Session, status: SessionStatus, halt_reason: Option<&str>) -> String {
    let reason = halt_reason.unwrap_or("unknown");
    match status {
        SessionStatus::Completed => session
            .steps
            .iter()
            .rev()
            .find(|s| s.action_type == ActionType::Respond && s.is_completed())
            .and_then(|s| s.output_data.as_ref())
            .and_then(|out| out.get("text"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        SessionStatus::Failed => {
            format!("I encountered an error while processing your request: {reason}")
        }
        SessionStatus::Halted => {
            format!("I apologize, but I couldn't complete your request ({reason}).")
        }
    }
}
