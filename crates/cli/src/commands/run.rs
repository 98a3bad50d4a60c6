//! `stepline run`: orchestrate one message and print the result.

use std::sync::Arc;

use stepline_config::AppConfig;
use stepline_core::event::EventBus;
use stepline_core::message::Message;
use stepline_gateway::ChatResponse;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub async fn run(
    config: AppConfig,
    message: String,
    system: Option<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let event_bus = Arc::new(EventBus::default());
    let logger = super::spawn_event_logger(&event_bus);
    let orchestrator = stepline_gateway::build_orchestrator(&config, event_bus)?;

    let mut messages = Vec::new();
    if let Some(system) = system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(message));

    // Ctrl-C stops the session at the next step boundary
    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            on_interrupt.cancel();
        }
    });

    let outcome = orchestrator.run(messages, cancel).await?;
    println!("{}", serde_json::to_string_pretty(&ChatResponse::from(outcome))?);

    // Dropping the orchestrator closes the bus; let the logger drain
    drop(orchestrator);
    let _ = logger.await;
    Ok(())
}
