//! Completion tracker: polls a started copy until it settles or time runs out.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::domain::{CopyStatus, CopyTaskHandle, TerminalStatus};
use crate::ports::ObjectStore;

/// Status string reported when the copy status cannot be read at all.
pub const UNREADABLE_STATUS: &str = "unreadable";

/// Poll pacing: `interval` grows by `multiplier` up to `max_interval`.
#[derive(Debug, Clone, PartialEq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub max_interval: Duration,
    pub multiplier: f64,
    pub timeout: Duration,
}

impl PollPolicy {
    pub fn next_interval(&self, current: Duration) -> Duration {
        current
            .mul_f64(self.multiplier.max(1.0))
            .min(self.max_interval)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            multiplier: 1.5,
            timeout: Duration::from_secs(300),
        }
    }
}

pub struct CompletionTracker {
    store: Arc<dyn ObjectStore>,
}

impl CompletionTracker {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Wait for `handle` to reach a terminal status.
    ///
    /// Transient read errors are tolerated until the deadline. The last
    /// sleep is shortened so that one poll happens right at the deadline.
    pub async fn await_completion(
        &self,
        handle: &CopyTaskHandle,
        policy: &PollPolicy,
    ) -> TerminalStatus {
        if handle.initial_status == Some(CopyStatus::Success) {
            return TerminalStatus::Succeeded { polls: 0 };
        }

        let started = Instant::now();
        let deadline = started + policy.timeout;
        let mut interval = policy.interval;
        let mut polls: u32 = 0;
        let mut last_status = handle.initial_status.clone();
        let mut last_error = None;

        loop {
            polls += 1;
            match self.store.get_copy_status(&handle.store_handle).await {
                Ok(report) => match report.status {
                    CopyStatus::Success => return TerminalStatus::Succeeded { polls },
                    CopyStatus::Pending => {
                        debug!(task_id = %handle.task_id, polls, "copy pending");
                        last_status = Some(CopyStatus::Pending);
                    }
                    // failed, aborted and anything unknown
                    other => {
                        return TerminalStatus::Failed {
                            status: other.as_str().to_string(),
                            description: report.description,
                        };
                    }
                },
                Err(err) if err.is_transient() => {
                    debug!(task_id = %handle.task_id, polls, error = %err, "copy status read failed");
                    last_error = Some(err.to_string());
                }
                Err(err) => {
                    return TerminalStatus::Failed {
                        status: UNREADABLE_STATUS.to_string(),
                        description: Some(err.to_string()),
                    };
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return TerminalStatus::TimedOut {
                    waited: now - started,
                    last_status,
                    last_error,
                };
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
            interval = policy.next_interval(interval);
        }
    }
}
