//! `/chat` and `/tools` handlers.

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stepline_core::session::SessionStatus;
use stepline_core::step::{ActionType, Step, StepError, StepStatus};
use stepline_orchestrator::RunOutcome;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::SharedState;

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, error: impl Into<String>, field: Option<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.into(),
            field,
        }),
    )
}

/// One step as the chat widget renders it.
#[derive(Debug, Serialize, Deserialize)]
pub struct StepView {
    pub index: usize,
    pub action_type: ActionType,
    pub status: StepStatus,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_data: Option<Value>,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

impl From<Step> for StepView {
    fn from(step: Step) -> Self {
        Self {
            index: step.index,
            action_type: step.action_type,
            status: step.status,
            description: step.description,
            output_data: step.output_data,
            attempt_count: step.attempt_count,
            error: step.error,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub response: String,
    pub steps: Vec<StepView>,
    pub tokens_used: u64,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub halt_reason: Option<String>,
}

impl From<RunOutcome> for ChatResponse {
    fn from(outcome: RunOutcome) -> Self {
        Self {
            session_id: outcome.session_id,
            response: outcome.response,
            steps: outcome.steps.into_iter().map(StepView::from).collect(),
            tokens_used: outcome.tokens_used,
            status: outcome.status,
            halt_reason: outcome.halt_reason,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolDto {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDto>,
    pub count: usize,
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// Run one orchestration session.
///
/// Every terminal session status is a 200. Bodies that are not JSON are
/// rejected by axum (400 for syntax errors); JSON that does not match the
/// request schema is a 422 naming the field. A 500 means the session task
/// itself died.
pub(crate) async fn chat_handler(
    State(state): State<SharedState>,
    payload: Result<Json<Value>, JsonRejection>,
) -> Result<Json<ChatResponse>, ApiError> {
    let Json(body) = payload.map_err(|rejection| {
        warn!(error = %rejection.body_text(), "Rejected chat request body");
        api_error(rejection.status(), rejection.body_text(), None)
    })?;

    let messages = state.orchestrator.parse_request(&body).map_err(|e| {
        warn!(error = %e, "Chat request failed validation");
        api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            e.to_string(),
            e.field().map(String::from),
        )
    })?;
    info!(messages = messages.len(), "Chat request");

    // Dropping the request future (client went away) cancels the session.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let orchestrator = state.orchestrator.clone();
    let task = tokio::spawn(async move { orchestrator.run(messages, cancel).await });
    let joined = task.await;
    guard.disarm();

    match joined {
        Ok(Ok(outcome)) => Ok(Json(ChatResponse::from(outcome))),
        Ok(Err(e)) => Err(api_error(
            StatusCode::UNPROCESSABLE_ENTITY,
            e.to_string(),
            e.field().map(String::from),
        )),
        Err(join_error) => {
            error!(error = %join_error, "Orchestration task failed");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error while orchestrating the request",
                None,
            ))
        }
    }
}

pub(crate) async fn list_tools_handler(State(state): State<SharedState>) -> Json<ToolListResponse> {
    let defs = state.orchestrator.tools().definitions();
    let count = defs.len();

    Json(ToolListResponse {
        tools: defs
            .into_iter()
            .map(|d| ToolDto {
                name: d.name,
                description: d.description,
                parameters: d.parameters,
            })
            .collect(),
        count,
    })
}
