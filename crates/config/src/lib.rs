//! Configuration loading, validation, and management for Stepline.
//!
//! Loads configuration from `~/.stepline/config.toml` (or an explicit path)
//! with environment variable overrides. Validates all settings at startup;
//! the resulting `AppConfig` is read-only for the life of the process.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.stepline/config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// HTTP gateway configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Orchestration loop limits
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    /// Reference keyword retriever
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Built-in guardrail presets
    #[serde(default)]
    pub guardrails: GuardrailsConfig,

    /// Guardrail contracts evaluated at the act/respond checkpoints
    #[serde(default)]
    pub contracts: Vec<ContractConfig>,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_true() -> bool {
    true
}

// ── Gateway ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_host")]
    pub host: String,

    /// Maximum request body size in bytes
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Requests per minute per client; 0 disables rate limiting
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_minute: u32,

    /// Origins allowed by CORS; empty allows none
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,
}

fn default_port() -> u16 {
    8080
}
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_body_limit() -> usize {
    1024 * 1024
}
fn default_rate_limit() -> u32 {
    60
}
fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".into()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            body_limit_bytes: default_body_limit(),
            rate_limit_per_minute: default_rate_limit(),
            cors_origins: default_cors_origins(),
        }
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum steps per session
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,

    /// Additional attempts allowed for a step that fails transiently
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential retry backoff; 0 retries immediately
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Deadline for a single retriever/tool call
    #[serde(default = "default_collaborator_timeout_ms")]
    pub collaborator_timeout_ms: u64,

    /// Wall-clock budget for a whole session
    #[serde(default = "default_session_budget_ms")]
    pub session_budget_ms: u64,

    /// Insert a `verify` step before `respond` when passages were retrieved
    #[serde(default = "default_true")]
    pub verify_citations: bool,
}

fn default_max_steps() -> usize {
    10
}
fn default_max_retries() -> u32 {
    2
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_collaborator_timeout_ms() -> u64 {
    30_000
}
fn default_session_budget_ms() -> u64 {
    120_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            collaborator_timeout_ms: default_collaborator_timeout_ms(),
            session_budget_ms: default_session_budget_ms(),
            verify_citations: true,
        }
    }
}

// ── Retrieval ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Whether the keyword retriever is wired into the loop
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Passages returned when a step does not ask for a limit
    #[serde(default = "default_retrieval_limit")]
    pub default_limit: usize,

    /// Minimum keyword-overlap score for a passage to be returned
    #[serde(default)]
    pub min_score: f64,

    /// The corpus
    #[serde(default)]
    pub passages: Vec<PassageConfig>,
}

fn default_retrieval_limit() -> usize {
    3
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_limit: default_retrieval_limit(),
            min_score: 0.0,
            passages: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassageConfig {
    /// Citation id; generated from the position when omitted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default)]
    pub source: String,

    pub content: String,

    /// Free-form metadata matched against retrieve-step filters
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

// ── Guardrails ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardrailsConfig {
    /// Redact e-mail addresses, phone numbers and card numbers from
    /// tool results and responses
    #[serde(default)]
    pub pii_redaction: bool,

    /// Terms that cause a response to be denied outright
    #[serde(default)]
    pub blocked_terms: Vec<String>,
}

/// One guardrail contract, as written in TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    /// Unique name for this contract
    pub name: String,

    #[serde(default)]
    pub description: String,

    /// What triggers this contract (e.g. "tool:send_email", "tool:*", "response")
    pub trigger: String,

    /// Condition expression (e.g. `output.text CONTAINS "password"`)
    #[serde(default)]
    pub condition: String,

    /// Action to take: "deny", "warn", "allow", "redact"
    #[serde(default = "default_deny")]
    pub action: String,

    /// Message to display when the contract fires
    #[serde(default)]
    pub message: String,

    /// Regex whose matches are replaced, for "redact"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,

    /// Replacement text, for "redact"
    #[serde(default = "default_replacement")]
    pub replacement: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Priority (higher = evaluated first)
    #[serde(default)]
    pub priority: i32,
}

fn default_deny() -> String {
    "deny".into()
}
fn default_replacement() -> String {
    "[REDACTED]".into()
}

// ── Logging ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────────

const ACTIONS: [&str; 4] = ["deny", "warn", "allow", "redact"];

impl AppConfig {
    /// Load configuration from the default path (~/.stepline/config.toml),
    /// then apply environment overrides:
    /// - `STEPLINE_HOST`
    /// - `STEPLINE_PORT`
    /// - `STEPLINE_MAX_STEPS`
    /// - `STEPLINE_LOG_JSON`
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_overrides(&Self::config_dir().join("config.toml"))
    }

    /// Load from `path` and apply environment overrides.
    pub fn load_with_overrides(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_from(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup.
    pub fn apply_env_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(host) = lookup("STEPLINE_HOST") {
            self.gateway.host = host;
        }
        if let Some(port) = lookup("STEPLINE_PORT") {
            self.gateway.port = port.parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEPLINE_PORT is not a port: {port}"))
            })?;
        }
        if let Some(steps) = lookup("STEPLINE_MAX_STEPS") {
            self.orchestrator.max_steps = steps.parse().map_err(|_| {
                ConfigError::ValidationError(format!("STEPLINE_MAX_STEPS is not a number: {steps}"))
            })?;
        }
        if let Some(json) = lookup("STEPLINE_LOG_JSON") {
            self.logging.json = match json.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "STEPLINE_LOG_JSON is not a boolean: {json}"
                    )));
                }
            };
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".stepline")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let orch = &self.orchestrator;
        if orch.max_steps == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.max_steps must be at least 1".into(),
            ));
        }
        if orch.collaborator_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.collaborator_timeout_ms must be > 0".into(),
            ));
        }
        if orch.session_budget_ms == 0 {
            return Err(ConfigError::ValidationError(
                "orchestrator.session_budget_ms must be > 0".into(),
            ));
        }
        if self.gateway.body_limit_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "gateway.body_limit_bytes must be > 0".into(),
            ));
        }
        if self.retrieval.default_limit == 0 {
            return Err(ConfigError::ValidationError(
                "retrieval.default_limit must be at least 1".into(),
            ));
        }

        for (i, contract) in self.contracts.iter().enumerate() {
            if contract.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "contracts[{i}].name cannot be empty"
                )));
            }
            if !ACTIONS.contains(&contract.action.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "contract '{}' has unknown action '{}' (expected one of {})",
                    contract.name,
                    contract.action,
                    ACTIONS.join(", ")
                )));
            }
            if contract.action == "redact" && contract.pattern.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "contract '{}' uses action 'redact' but has no pattern",
                    contract.name
                )));
            }
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        Self::default().to_toml().unwrap_or_default()
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to render configuration: {0}")]
    SerializeError(String),
}
