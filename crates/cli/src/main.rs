//! Stepline CLI, the main entry point.
//!
//! Commands:
//! - `serve`   Start the HTTP gateway (`POST /chat`)
//! - `run`     Orchestrate a single message and print the result as JSON
//! - `config`  Show, check or locate the configuration

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use stepline_config::{AppConfig, ConfigError, LoggingConfig};

mod commands;

#[derive(Parser)]
#[command(
    name = "stepline",
    about = "Stepline: bounded agent orchestration behind a chat endpoint",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (defaults to ~/.stepline/config.toml)
    #[arg(short, long, global = true, env = "STEPLINE_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway server
    Serve {
        /// Override the port
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Orchestrate one message and print the session as JSON
    Run {
        /// The user message
        #[arg(short, long)]
        message: String,

        /// Optional system prompt placed before the message
        #[arg(long)]
        system: Option<String>,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Validate the configuration and its guardrail contracts
    Check,
    /// Print the default configuration file path
    Path,
}

fn load_config(path: Option<&std::path::Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_with_overrides(path),
        None => AppConfig::load(),
    }
}

/// Logs go to stderr so `run` can print clean JSON on stdout.
fn init_tracing(logging: &LoggingConfig, verbose: bool) {
    let default = if verbose { "debug" } else { logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_deref());
    let logging = config
        .as_ref()
        .map(|c| c.logging.clone())
        .unwrap_or_default();
    init_tracing(&logging, cli.verbose);

    match cli.command {
        Commands::Serve { port } => commands::serve::run(config?, port).await?,
        Commands::Run { message, system } => commands::run::run(config?, message, system).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => commands::config_cmd::show(config?)?,
            ConfigAction::Check => commands::config_cmd::check(config)?,
            ConfigAction::Path => commands::config_cmd::path(),
        },
    }

    Ok(())
}
