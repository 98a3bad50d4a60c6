//! Read-only loop settings, built once from configuration.

use std::time::Duration;

use stepline_config::AppConfig;

/// Limits and toggles the orchestration loop runs under.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Step ceiling per session
    pub max_steps: usize,

    /// Additional attempts for a transiently failing step
    pub max_retries: u32,

    /// Base delay of the exponential retry backoff
    pub retry_backoff: Duration,

    /// Deadline for each planner, retriever and tool call
    pub collaborator_timeout: Duration,

    /// Wall-clock budget for the whole session
    pub session_budget: Duration,

    /// Insert a synthetic `verify` step before `respond` after retrieval
    pub verify_citations: bool,

    /// Passages requested when a `retrieve` input omits `limit`
    pub default_retrieval_limit: usize,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_steps: 10,
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            collaborator_timeout: Duration::from_secs(30),
            session_budget: Duration::from_secs(120),
            verify_citations: true,
            default_retrieval_limit: 3,
        }
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        let o = &config.orchestrator;
        Self {
            max_steps: o.max_steps,
            max_retries: o.max_retries,
            retry_backoff: Duration::from_millis(o.retry_backoff_ms),
            collaborator_timeout: Duration::from_millis(o.collaborator_timeout_ms),
            session_budget: Duration::from_millis(o.session_budget_ms),
            verify_citations: o.verify_citations,
            default_retrieval_limit: config.retrieval.default_limit,
        }
    }

    pub fn with_max_steps(mut self, max_steps: usize) -> Self {
        self.max_steps = max_steps;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_collaborator_timeout(mut self, timeout: Duration) -> Self {
        self.collaborator_timeout = timeout;
        self
    }

    pub fn with_session_budget(mut self, budget: Duration) -> Self {
        self.session_budget = budget;
        self
    }

    pub fn with_verify_citations(mut self, enabled: bool) -> Self {
        self.verify_citations = enabled;
        self
    }
}
