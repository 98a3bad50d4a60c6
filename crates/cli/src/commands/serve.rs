//! `stepline serve`: start the HTTP gateway.

use std::sync::Arc;

use stepline_config::AppConfig;
use stepline_core::event::EventBus;

pub async fn run(mut config: AppConfig, port_override: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(port) = port_override {
        config.gateway.port = port;
    }

    println!("Stepline gateway");
    println!("   Listening:  {}:{}", config.gateway.host, config.gateway.port);
    println!("   Max steps:  {}", config.orchestrator.max_steps);
    println!("   Retrieval:  {}", if config.retrieval.enabled { "on" } else { "off" });
    println!("   Contracts:  {}", config.contracts.len());

    let event_bus = Arc::new(EventBus::default());
    let _logger = super::spawn_event_logger(&event_bus);
    stepline_gateway::start(config, event_bus).await?;

    Ok(())
}
