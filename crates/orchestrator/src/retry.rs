//! Per-step retry decisions.

use std::time::Duration;

use stepline_core::step::{ErrorKind, Step};

/// What to do with a failed step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-run the same step (same index, same input) after `delay`
    Retry { delay: Duration },
    GiveUp,
}

/// Retries transient failures with exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    backoff_base: Duration,
}

/// Backoff doubling stops here so the delay cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Decide for `step`, which has already been retried `attempt_count`
    /// times and just failed with `kind`.
    ///
    /// Only `collaborator_timeout` and `transient_io` are retried. Schema and
    /// guardrail failures are final.
    pub fn should_retry(&self, step: &Step, attempt_count: u32, kind: ErrorKind) -> RetryDecision {
        if !kind.is_transient() || attempt_count >= self.max_retries {
            return RetryDecision::GiveUp;
        }
        tracing::debug!(
            step = step.index,
            action = %step.action_type,
            attempt = attempt_count + 1,
            "Retrying step"
        );
        RetryDecision::Retry {
            delay: self.delay_for(attempt_count),
        }
    }

    /// `base * 2^attempt`.
    pub fn delay_for(&self, attempt_count: u32) -> Duration {
        let factor = 1u32 << attempt_count.min(MAX_BACKOFF_SHIFT);
        self.backoff_base.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_millis(250))
    }
}
