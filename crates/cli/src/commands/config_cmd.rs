//! `stepline config`: configuration management commands.

use stepline_config::{AppConfig, ConfigError};
use stepline_guardrails::ContractPolicy;

pub fn show(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", config.to_toml()?);
    Ok(())
}

pub fn check(config: Result<AppConfig, ConfigError>) -> Result<(), Box<dyn std::error::Error>> {
    println!("Validating configuration...");

    let config = match config {
        Ok(config) => config,
        Err(e) => {
            println!("   Config error: {e}");
            return Err(e.into());
        }
    };
    println!("   Config parsed successfully");

    // Conditions and patterns are only compiled when the engine is built
    let policy = match ContractPolicy::from_config(&config) {
        Ok(policy) => policy,
        Err(e) => {
            println!("   Contract error: {e}");
            return Err(e.into());
        }
    };

    let mut warnings = Vec::new();
    if config.gateway.host == "0.0.0.0" {
        warnings.push("Gateway binds every interface (0.0.0.0)");
    }
    if config.retrieval.enabled && config.retrieval.passages.is_empty() {
        warnings.push("Retrieval is enabled but no passages are configured");
    }
    if config.gateway.rate_limit_per_minute == 0 {
        warnings.push("Rate limiting is disabled");
    }

    if warnings.is_empty() {
        println!("   All checks passed");
    } else {
        println!();
        for w in &warnings {
            println!("   warning: {w}");
        }
    }

    println!();
    println!("   Gateway:    {}:{}", config.gateway.host, config.gateway.port);
    println!(
        "   Limits:     {} steps, {} retries, {}ms per call, {}ms per session",
        config.orchestrator.max_steps,
        config.orchestrator.max_retries,
        config.orchestrator.collaborator_timeout_ms,
        config.orchestrator.session_budget_ms
    );
    println!("   Passages:   {}", config.retrieval.passages.len());
    println!("   Contracts:  {} active", policy.engine().active_count());

    Ok(())
}

pub fn path() {
    let config_path = AppConfig::config_dir().join("config.toml");
    println!("{}", config_path.display());
}
