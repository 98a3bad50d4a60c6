//! HTTP gateway for Stepline.
//!
//! Exposes `POST /chat` for the chat widget, plus `GET /health` and
//! `GET /tools`. Each chat request runs its session in its own task.
//!
//! Built on Axum.

mod chat;

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::{
    Router,
    middleware::{self, Next},
    response::Json,
    routing::{get, post},
};
use serde::Serialize;
use stepline_config::{AppConfig, GatewayConfig};
use stepline_core::event::EventBus;
use stepline_core::tool::{ToolInvoker, ToolRegistry};
use stepline_guardrails::{ContractError, ContractPolicy};
use stepline_orchestrator::{Orchestrator, OrchestratorSettings, PipelinePlanner};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{info, warn};

pub use chat::{ChatResponse, ErrorResponse, StepView, ToolDto, ToolListResponse};

/// Shared, read-only application state.
pub struct GatewayState {
    pub orchestrator: Arc<Orchestrator>,
}

pub type SharedState = Arc<GatewayState>;

/// Wire the orchestrator from configuration: pipeline planner, keyword
/// retriever, contract guardrails, and an (empty) tool registry.
pub fn build_orchestrator(
    config: &AppConfig,
    event_bus: Arc<EventBus>,
) -> Result<Orchestrator, ContractError> {
    let retriever = stepline_retrieval::from_config(&config.retrieval);
    let tools: Arc<dyn ToolInvoker> = Arc::new(ToolRegistry::new());
    let policy = ContractPolicy::from_config(config)?;
    info!(
        contracts = policy.engine().active_count(),
        retrieval = retriever.is_some(),
        "Guardrail contracts loaded"
    );

    let planner = PipelinePlanner::new(tools.definitions(), retriever.is_some());
    let mut orchestrator = Orchestrator::new(
        Arc::new(planner),
        OrchestratorSettings::from_config(config),
    )
    .with_tools(tools)
    .with_policy(Arc::new(policy))
    .with_event_bus(event_bus);
    if let Some(retriever) = retriever {
        orchestrator = orchestrator.with_retriever(retriever);
    }
    Ok(orchestrator)
}

/// Build the router with every route and layer.
///
/// Layers applied:
/// - CORS limited to the configured origins
/// - Request body size limit
/// - In-memory rate limiting per client (`/health` exempt)
/// - HTTP trace logging
pub fn build_router(state: SharedState, config: &GatewayConfig) -> Router {
    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    let rate_limiter = Arc::new(RateLimiter::new(
        config.rate_limit_per_minute as usize,
        std::time::Duration::from_secs(60),
    ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/chat", post(chat::chat_handler))
        .route("/tools", get(chat::list_tools_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(config.body_limit_bytes))
        .layer(middleware::from_fn(move |req, next| {
            let limiter = rate_limiter.clone();
            rate_limit_middleware(limiter, req, next)
        }))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}

/// Start the gateway HTTP server and serve until Ctrl-C.
pub async fn start(
    config: AppConfig,
    event_bus: Arc<EventBus>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{}:{}", config.gateway.host, config.gateway.port);

    let orchestrator = Arc::new(build_orchestrator(&config, event_bus)?);
    let state = Arc::new(GatewayState { orchestrator });
    let app = build_router(state, &config.gateway);

    info!(addr = %addr, "Gateway starting");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Could not listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

// --- Rate Limiter ---

/// Simple in-memory sliding-window rate limiter.
///
/// Tracks request timestamps per client key.
/// Thread-safe via `std::sync::Mutex` (non-async, held briefly).
struct RateLimiter {
    max_requests: usize,
    window: std::time::Duration,
    clients: std::sync::Mutex<HashMap<String, Vec<std::time::Instant>>>,
}

impl RateLimiter {
    fn new(max_requests: usize, window: std::time::Duration) -> Self {
        Self {
            max_requests,
            window,
            clients: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// Check if the client is within rate limits. Returns `true` if allowed.
    /// A limit of 0 allows everything.
    fn check(&self, client_key: &str) -> bool {
        if self.max_requests == 0 {
            return true;
        }
        let now = std::time::Instant::now();
        let mut clients = self.clients.lock().unwrap_or_else(|e| e.into_inner());

        // Evict stale clients once the map grows large
        if clients.len() > 10_000 {
            clients.retain(|_, timestamps| {
                timestamps
                    .last()
                    .is_some_and(|t| now.duration_since(*t) < self.window)
            });
        }

        let timestamps = clients.entry(client_key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);

        if timestamps.len() >= self.max_requests {
            return false;
        }

        timestamps.push(now);
        true
    }
}

/// Keys clients by `X-Client-Id`, then the first `X-Forwarded-For` hop,
/// falling back to "anonymous". Returns 429 when the window is full.
async fn rate_limit_middleware(
    limiter: Arc<RateLimiter>,
    req: axum::extract::Request,
    next: Next,
) -> Result<axum::response::Response, StatusCode> {
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let headers = req.headers();
    let client_key = headers
        .get("x-client-id")
        .or_else(|| headers.get("x-forwarded-for"))
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "anonymous".to_string());

    if !limiter.check(&client_key) {
        warn!(client = %client_key.chars().take(40).collect::<String>(), "Rate limit exceeded");
        return Err(StatusCode::TOO_MANY_REQUESTS);
    }

    Ok(next.run(req).await)
}

// --- Handlers ---

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use stepline_core::error::PlanningError;
    use stepline_core::message::Message;
    use stepline_core::plan::{Plan, Planner};
    use stepline_core::session::SessionStatus;
    use stepline_core::step::{ActionType, Step};
    use tower::ServiceExt;

    /// Plans once, then answers with a fixed text.
    struct AnswerPlanner(&'static str);

    #[async_trait]
    impl Planner for AnswerPlanner {
        fn name(&self) -> &str {
            "answer"
        }

        async fn next_step(&self, _history: &[Message], trace: &[Step]) -> Result<Plan, PlanningError> {
            Ok(match trace.len() {
                0 => Plan::step(ActionType::Plan, "Work out the answer", json!({})),
                1 => Plan::step(ActionType::Respond, "Answer", json!({ "text": self.0 })),
                _ => Plan::Done,
            })
        }
    }

    struct PanickingPlanner;

    #[async_trait]
    impl Planner for PanickingPlanner {
        fn name(&self) -> &str {
            "panicking"
        }

        async fn next_step(&self, _history: &[Message], _trace: &[Step]) -> Result<Plan, PlanningError> {
            panic!("planner bug");
        }
    }

    fn app_with(planner: Arc<dyn Planner>, config: &GatewayConfig) -> Router {
        let orchestrator = Orchestrator::new(planner, OrchestratorSettings::default());
        build_router(
            Arc::new(GatewayState {
                orchestrator: Arc::new(orchestrator),
            }),
            config,
        )
    }

    fn app() -> Router {
        app_with(Arc::new(AnswerPlanner("4")), &GatewayConfig::default())
    }

    fn chat_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/chat")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn json_body(response: axum::response::Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn health_endpoint() {
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["version"], env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn chat_runs_a_session() {
        let response = app()
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"What is 2+2?"}]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let chat: ChatResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(chat.status, SessionStatus::Completed);
        assert_eq!(chat.response, "4");
        assert_eq!(chat.steps.len(), 2);
        assert_eq!(chat.steps[0].action_type, ActionType::Plan);
        assert_eq!(chat.steps[1].index, 1);
        assert!(chat.halt_reason.is_none());
    }

    #[tokio::test]
    async fn halted_session_is_still_200() {
        let response = app_with(Arc::new(AnswerPlanner("")), &GatewayConfig::default())
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], "halted");
        assert!(json["halt_reason"].as_str().unwrap().starts_with("schema_invalid"));
        assert_eq!(json["steps"][1]["error"]["kind"], "schema_invalid");
        assert_eq!(json["steps"][1]["error"]["field"], "text");
    }

    #[tokio::test]
    async fn malformed_json_is_400() {
        let response = app().oneshot(chat_request(r#"{"messages": ["#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = json_body(response).await;
        assert!(json["error"].is_string());
    }

    #[tokio::test]
    async fn schema_violation_is_422_with_field() {
        let response = app()
            .oneshot(chat_request(r#"{"messages":[{"role":"robot","content":"hi"}]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let json = json_body(response).await;
        assert_eq!(json["field"], "messages[0].role");

        let response = app().oneshot(chat_request(r#"{"messages":[]}"#)).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(json_body(response).await["field"], "messages");
    }

    #[tokio::test]
    async fn panicking_session_is_500() {
        let response = app_with(Arc::new(PanickingPlanner), &GatewayConfig::default())
            .oneshot(chat_request(r#"{"messages":[{"role":"user","content":"hi"}]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn tools_lists_registered_tools() {
        let req = Request::builder().uri("/tools").body(Body::empty()).unwrap();
        let response = app().oneshot(req).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let tools: ToolListResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(tools.count, 0);
    }

    #[tokio::test]
    async fn rate_limit_exempts_health() {
        let config = GatewayConfig {
            rate_limit_per_minute: 1,
            ..GatewayConfig::default()
        };
        let app = app_with(Arc::new(AnswerPlanner("4")), &config);
        let body = r#"{"messages":[{"role":"user","content":"hi"}]}"#;

        let first = app.clone().oneshot(chat_request(body)).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);
        let second = app.clone().oneshot(chat_request(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);

        let mut other = chat_request(body);
        other
            .headers_mut()
            .insert("x-client-id", HeaderValue::from_static("widget-2"));
        assert_eq!(app.clone().oneshot(other).await.unwrap().status(), StatusCode::OK);

        let health = Request::builder().uri("/health").body(Body::empty()).unwrap();
        assert_eq!(app.oneshot(health).await.unwrap().status(), StatusCode::OK);
    }

    #[test]
    fn zero_limit_disables_rate_limiting() {
        let limiter = RateLimiter::new(0, std::time::Duration::from_secs(60));
        assert!((0..100).all(|_| limiter.check("anonymous")));
    }

    #[test]
    fn builds_orchestrator_from_default_config() {
        let config = AppConfig::default();
        let orchestrator = build_orchestrator(&config, Arc::new(EventBus::default())).unwrap();
        assert_eq!(orchestrator.settings().max_steps, 10);
        assert!(orchestrator.tools().definitions().is_empty());
    }

    #[test]
    fn bad_contract_fails_to_build() {
        let config: AppConfig = toml::from_str(
            r#"
[[contracts]]
name = "broken"
trigger = "response"
condition = 'content CONTAINS'
"#,
        )
        .unwrap();
        assert!(build_orchestrator(&config, Arc::new(EventBus::default())).is_err());
    }
}
