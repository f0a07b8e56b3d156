use std::fmt;
use std::time::Duration;

use crate::models::Target;

/// Where a fetch job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Fetching,
    Extracting,
    RetryScheduled,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Fetching => "fetching",
            JobState::Extracting => "extracting",
            JobState::RetryScheduled => "retry_scheduled",
            JobState::Succeeded => "succeeded",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Retry budget and exponential backoff.
///
/// `max_retries` is the total number of fetch attempts a job may spend.
/// Delay before attempt `n + 1` is `base_delay * 2^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// Backoff after the given (1-indexed) failed attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exponent);
        delay.min(self.max_delay)
    }
}

/// One target moving through the fetch state machine.
///
/// Owned by exactly one worker at a time; handed back to the queue only
/// when a retry is scheduled.
#[derive(Debug, Clone)]
pub struct FetchJob {
    pub target: Target,
    pub attempt: u32,
    pub last_error: Option<String>,
    pub state: JobState,
}

impl FetchJob {
    pub fn new(target: Target) -> Self {
        Self {
            target,
            attempt: 0,
            last_error: None,
            state: JobState::Pending,
        }
    }

    pub fn key(&self) -> &str {
        self.target.key()
    }

    /// Whether another attempt fits in the budget.
    pub fn can_retry(&self, config: &RetryConfig) -> bool {
        self.attempt < config.max_retries
    }

    pub fn transition(&mut self, next: JobState) {
        tracing::trace!(
            target_key = %self.target,
            from = %self.state,
            to = %next,
            "Job transition"
        );
        self.state = next;
    }
}
