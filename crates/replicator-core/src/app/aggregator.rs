//! Aggregation of per-pair results into per-destination reports.
//!
//! Fed by a single consumer of the workers' result channel. Each
//! (destination, object) pair is recorded at most once; later results for an
//! already recorded pair are dropped.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use crate::domain::{
    AccountName, ContainerName, DestinationReport, ErrorKind, FailedObject, ObjectIdentity,
};

/// How one pair ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairOutcome {
    Succeeded,
    Failed { kind: ErrorKind, message: String },
}

/// Message sent by a worker when it is done with a pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairResult {
    pub destination: AccountName,
    pub object: ObjectIdentity,
    pub outcome: PairOutcome,
}

pub struct Aggregator {
    reports: Vec<DestinationReport>,
    index: HashMap<AccountName, usize>,
    recorded: HashSet<(AccountName, ObjectIdentity)>,
}

impl Aggregator {
    /// One report per destination, in the given order.
    pub fn new(destinations: &[AccountName], container: &ContainerName, objects: usize) -> Self {
        let reports: Vec<_> = destinations
            .iter()
            .map(|account| DestinationReport::new(account.clone(), container.clone(), objects))
            .collect();
        let index = destinations
            .iter()
            .enumerate()
            .map(|(i, account)| (account.clone(), i))
            .collect();
        Self {
            reports,
            index,
            recorded: HashSet::new(),
        }
    }

    /// Returns `false` if the pair was already recorded or the destination is
    /// unknown.
    pub fn record(&mut self, result: PairResult) -> bool {
        let Some(&i) = self.index.get(&result.destination) else {
            warn!(destination = %result.destination, "result for unknown destination dropped");
            return false;
        };
        if !self
            .recorded
            .insert((result.destination.clone(), result.object.clone()))
        {
            warn!(destination = %result.destination, object = %result.object, "duplicate result dropped");
            return false;
        }

        let report = &mut self.reports[i];
        match result.outcome {
            PairOutcome::Succeeded => report.succeeded += 1,
            PairOutcome::Failed { kind, message } => report.failed.push(FailedObject {
                object: result.object,
                kind,
                message,
            }),
        }
        true
    }

    pub fn is_recorded(&self, destination: &AccountName, object: &ObjectIdentity) -> bool {
        self.recorded
            .contains(&(destination.clone(), object.clone()))
    }

    /// Record every unrecorded pair of `destination` as failed.
    pub fn fail_destination(
        &mut self,
        destination: &AccountName,
        objects: &[ObjectIdentity],
        kind: ErrorKind,
        message: &str,
    ) {
        for object in objects {
            self.record(PairResult {
                destination: destination.clone(),
                object: object.clone(),
                outcome: PairOutcome::Failed {
                    kind,
                    message: message.to_string(),
                },
            });
        }
    }

    /// Record every pair that has no result yet as failed.
    pub fn fail_unrecorded(&mut self, objects: &[ObjectIdentity], kind: ErrorKind, message: &str) {
        let destinations: Vec<AccountName> =
            self.reports.iter().map(|r| r.account.clone()).collect();
        for destination in &destinations {
            self.fail_destination(destination, objects, kind, message);
        }
    }

    pub fn finish(self) -> Vec<DestinationReport> {
        self.reports
    }
}
