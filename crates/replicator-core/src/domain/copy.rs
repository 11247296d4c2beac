//! Copy task state machine and status values.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ids::TaskId;
use super::names::{ContainerHandle, ObjectIdentity};

/// Copy status as reported by the destination store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStatus {
    Pending,
    Success,
    Failed,
    Aborted,
    /// Anything the store reports that we do not know about.
    Other(String),
}

impl CopyStatus {
    /// Parse the wire value (`x-ms-copy-status` and friends).
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => CopyStatus::Pending,
            "success" | "succeeded" => CopyStatus::Success,
            "failed" | "failure" => CopyStatus::Failed,
            "aborted" => CopyStatus::Aborted,
            other => CopyStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            CopyStatus::Pending => "pending",
            CopyStatus::Success => "success",
            CopyStatus::Failed => "failed",
            CopyStatus::Aborted => "aborted",
            CopyStatus::Other(raw) => raw,
        }
    }
}

impl fmt::Display for CopyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyStatusReport {
    pub status: CopyStatus,
    pub description: Option<String>,
}

impl CopyStatusReport {
    pub fn new(status: CopyStatus) -> Self {
        Self {
            status,
            description: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Store-side reference to a started copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CopyHandle {
    pub destination: ContainerHandle,
    pub object_name: String,
    /// Copy id assigned by the store, if it hands one out.
    pub copy_id: Option<String>,
}

/// A started copy, as returned by the copy initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyTaskHandle {
    pub task_id: TaskId,
    pub source: ObjectIdentity,
    pub store_handle: CopyHandle,
    /// Status reported by the start call itself, when the store returns one.
    pub initial_status: Option<CopyStatus>,
    /// Copy-start requests issued, including transient failures.
    pub start_attempts: u32,
}

/// Where a copy task currently is.
///
/// Transitions:
/// - NotStarted -> Pending -> Succeeded
/// - NotStarted -> Pending -> Failed
/// - NotStarted -> Failed (copy could not be started)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyTaskState {
    NotStarted,
    Pending,
    Succeeded,
    Failed,
}

impl CopyTaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CopyTaskState::Succeeded | CopyTaskState::Failed)
    }
}

/// A copy task: one (object, destination) pair.
#[derive(Debug, Clone)]
pub struct CopyTask {
    pub task_id: TaskId,
    pub object: ObjectIdentity,
    pub destination: ContainerHandle,
    pub state: CopyTaskState,
}

impl CopyTask {
    pub fn new(task_id: TaskId, object: ObjectIdentity, destination: ContainerHandle) -> Self {
        Self {
            task_id,
            object,
            destination,
            state: CopyTaskState::NotStarted,
        }
    }

    pub fn mark_pending(&mut self) {
        if !self.state.is_terminal() {
            self.state = CopyTaskState::Pending;
        }
    }

    /// Returns `false` if the task was already terminal (nothing changed).
    pub fn finish(&mut self, succeeded: bool) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = if succeeded {
            CopyTaskState::Succeeded
        } else {
            CopyTaskState::Failed
        };
        true
    }
}

/// Outcome of waiting for a copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalStatus {
    Succeeded {
        polls: u32,
    },
    Failed {
        /// Status string exactly as the store reported it.
        status: String,
        description: Option<String>,
    },
    TimedOut {
        waited: Duration,
        last_status: Option<CopyStatus>,
        last_error: Option<String>,
    },
}

impl TerminalStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, TerminalStatus::Succeeded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::names::{AccountName, ContainerName};
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case("pending", CopyStatus::Pending)]
    #[case("success", CopyStatus::Success)]
    #[case("SUCCESS", CopyStatus::Success)]
    #[case("failed", CopyStatus::Failed)]
    #[case("aborted", CopyStatus::Aborted)]
    #[case("paused", CopyStatus::Other("paused".to_string()))]
    fn copy_status_parses_wire_values(#[case] raw: &str, #[case] expected: CopyStatus) {
        assert_eq!(CopyStatus::parse(raw), expected);
    }

    #[test]
    fn unknown_status_keeps_original_string() {
        assert_eq!(CopyStatus::parse("paused").as_str(), "paused");
    }

    #[test]
    fn copy_task_finishes_exactly_once() {
        let handle = ContainerHandle::new(
            AccountName::new("dest").unwrap(),
            ContainerName::new("blobs").unwrap(),
        );
        let object = ObjectIdentity::new(
            AccountName::new("src").unwrap(),
            ContainerName::new("blobs").unwrap(),
            "a.txt",
        )
        .unwrap();
        let mut task = CopyTask::new(TaskId::from_ulid(Ulid::new()), object, handle);

        task.mark_pending();
        assert_eq!(task.state, CopyTaskState::Pending);

        assert!(task.finish(true));
        assert!(!task.finish(false));
        assert_eq!(task.state, CopyTaskState::Succeeded);

        task.mark_pending();
        assert_eq!(task.state, CopyTaskState::Succeeded);
    }
}
