//! Run report: what succeeded, what failed and why.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::ErrorKind;
use super::ids::RunId;
use super::names::{AccountName, ContainerName, ObjectIdentity};

/// Why the run stopped scheduling work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Completed,
    Cancelled,
    RunTimedOut,
}

/// One failed (object, destination) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedObject {
    pub object: ObjectIdentity,
    pub kind: ErrorKind,
    pub message: String,
}

/// Per-destination tally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationReport {
    pub account: AccountName,
    pub container: ContainerName,
    pub total: usize,
    pub succeeded: usize,
    pub failed: Vec<FailedObject>,
}

impl DestinationReport {
    pub fn new(account: AccountName, container: ContainerName, total: usize) -> Self {
        Self {
            account,
            container,
            total,
            succeeded: 0,
            failed: Vec::new(),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn is_complete_success(&self) -> bool {
        self.failed.is_empty() && self.succeeded == self.total
    }
}

impl fmt::Display for DestinationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {}/{} succeeded",
            self.account, self.succeeded, self.total
        )?;
        if !self.failed.is_empty() {
            write!(f, ", {} failed", self.failed.len())?;
        }
        Ok(())
    }
}

/// An object the populate step could not upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateFailure {
    pub name: String,
    pub message: String,
}

/// Final result of a replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationReport {
    pub run_id: RunId,
    pub source: AccountName,
    pub container: ContainerName,
    pub objects: usize,
    pub destinations: Vec<DestinationReport>,
    pub populated: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub populate_failures: Vec<PopulateFailure>,
    pub stop_reason: StopReason,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl ReplicationReport {
    /// True only if every (object, destination) pair succeeded.
    pub fn is_success(&self) -> bool {
        self.stop_reason == StopReason::Completed
            && self.populate_failures.is_empty()
            && self
                .destinations
                .iter()
                .all(DestinationReport::is_complete_success)
    }

    pub fn destination(&self, account: &AccountName) -> Option<&DestinationReport> {
        self.destinations.iter().find(|d| &d.account == account)
    }

    pub fn total_failed(&self) -> usize {
        self.destinations.iter().map(|d| d.failed.len()).sum()
    }

    pub fn failed_pairs(&self) -> impl Iterator<Item = (&DestinationReport, &FailedObject)> {
        self.destinations
            .iter()
            .flat_map(|d| d.failed.iter().map(move |f| (d, f)))
    }
}

impl fmt::Display for ReplicationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "run {} ({}/{}, {} objects, stop={:?})",
            self.run_id, self.source, self.container, self.objects, self.stop_reason
        )?;
        for destination in &self.destinations {
            writeln!(f, "  {destination}")?;
        }
        for failure in &self.populate_failures {
            writeln!(f, "  populate {}: {}", failure.name, failure.message)?;
        }
        for (destination, failed) in self.failed_pairs() {
            writeln!(
                f,
                "  {}/{}/{}: {}: {}",
                destination.account,
                destination.container,
                failed.object.name,
                failed.kind,
                failed.message
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn account(s: &str) -> AccountName {
        AccountName::new(s).unwrap()
    }

    fn container() -> ContainerName {
        ContainerName::new("blobs").unwrap()
    }

    fn report(destinations: Vec<DestinationReport>) -> ReplicationReport {
        let now = Utc::now();
        ReplicationReport {
            run_id: RunId::from_ulid(Ulid::new()),
            source: account("src"),
            container: container(),
            objects: 3,
            destinations,
            populated: 0,
            populate_failures: Vec::new(),
            stop_reason: StopReason::Completed,
            started_at: now,
            finished_at: now,
        }
    }

    #[test]
    fn run_succeeds_only_when_every_pair_succeeds() {
        let mut ok = DestinationReport::new(account("dsta"), container(), 3);
        ok.succeeded = 3;
        assert!(report(vec![ok.clone()]).is_success());

        let mut partial = DestinationReport::new(account("dstb"), container(), 3);
        partial.succeeded = 2;
        partial.failed.push(FailedObject {
            object: ObjectIdentity::new(account("src"), container(), "c.txt").unwrap(),
            kind: ErrorKind::CompletionTimeoutError,
            message: "no terminal status after 5s".into(),
        });
        let r = report(vec![ok, partial]);
        assert!(!r.is_success());
        assert_eq!(r.total_failed(), 1);

        let rendered = r.to_string();
        assert!(rendered.contains("dsta: 3/3 succeeded"));
        assert!(rendered.contains("dstb: 2/3 succeeded, 1 failed"));
        assert!(rendered.contains("dstb/blobs/c.txt: CompletionTimeoutError"));
    }

    #[test]
    fn cancelled_run_is_not_a_success() {
        let mut ok = DestinationReport::new(account("dsta"), container(), 0);
        ok.succeeded = 0;
        let mut r = report(vec![ok]);
        r.stop_reason = StopReason::Cancelled;
        assert!(!r.is_success());
    }
}
