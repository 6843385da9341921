//! Bounded polling of server-side processing status
//!
//! Uploaded and scraped sources are embedded by the backend in the
//! background. The poller checks the source record until it reaches a
//! terminal state or the attempt budget runs out. Failed checks are
//! swallowed and retried; only the terminal outcome is reported.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    /// Lenient mapping of the backend's status strings
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "completed" | "complete" | "done" | "success" | "ready" => Self::Completed,
            "failed" | "error" => Self::Failed,
            "processing" | "in_progress" | "running" => Self::Processing,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Completed,
    Failed,
    TimedOut { attempts: u32 },
}

/// Retry schedule for status polling
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PollPolicy {
    /// Delay before the second check
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Upper bound on the delay between checks
    #[serde(default = "default_max_interval_ms")]
    pub max_interval_ms: u64,

    /// Multiplier applied to the delay after each check
    #[serde(default = "default_backoff")]
    pub backoff: f64,

    /// Total number of checks before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_interval_ms() -> u64 {
    2_000
}

fn default_max_interval_ms() -> u64 {
    15_000
}

fn default_backoff() -> f64 {
    1.5
}

fn default_max_attempts() -> u32 {
    60
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            max_interval_ms: default_max_interval_ms(),
            backoff: default_backoff(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl PollPolicy {
    /// Delay after the check numbered `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.interval_ms as f64 * self.backoff.powi(attempt as i32);
        let capped = scaled.min(self.max_interval_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Run `check` until it reports a terminal status or the budget is spent.
pub async fn poll_until_settled<F, Fut>(policy: &PollPolicy, mut check: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<ProcessingStatus, BackendError>>,
{
    for attempt in 0..policy.max_attempts {
        match check().await {
            Ok(ProcessingStatus::Completed) => return PollOutcome::Completed,
            Ok(ProcessingStatus::Failed) => return PollOutcome::Failed,
            Ok(status) => tracing::debug!(attempt, ?status, "source still processing"),
            Err(err) => tracing::debug!(attempt, error = %err, "status check failed, retrying"),
        }

        if attempt + 1 < policy.max_attempts {
            tokio::time::sleep(policy.delay_for(attempt)).await;
        }
    }

    tracing::warn!(attempts = policy.max_attempts, "gave up waiting for source processing");
    PollOutcome::TimedOut {
        attempts: policy.max_attempts,
    }
}
