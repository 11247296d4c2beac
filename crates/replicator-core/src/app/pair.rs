//! One (object, destination) pair from authorization to terminal status.

use std::sync::Arc;
use std::time::Duration;

use tracing::{Instrument, debug, info, info_span, warn};

use super::aggregator::{PairOutcome, PairResult};
use super::delegation::DelegationCell;
use super::initiator::CopyInitiator;
use super::minter::AuthorizationMinter;
use super::tracker::{CompletionTracker, PollPolicy};
use crate::domain::{
    AttemptFailure, CopyTask, Decider, Decision, ErrorKind, Permission, ReplicationError,
    TaskProgress, TerminalStatus,
};
use crate::ports::IdGenerator;

/// Runs copy tasks to completion.
///
/// Loop per task: read the current credential, mint, start, track. On
/// failure the decider picks between re-minting (optionally replacing the
/// credential first), restarting the copy, or giving up.
pub struct PairReplicator {
    pub(crate) cell: Arc<DelegationCell>,
    pub(crate) minter: AuthorizationMinter,
    pub(crate) initiator: CopyInitiator,
    pub(crate) tracker: CompletionTracker,
    pub(crate) decider: Arc<dyn Decider>,
    pub(crate) ids: Arc<dyn IdGenerator>,
    pub(crate) authorization_ttl: Duration,
    pub(crate) poll: PollPolicy,
}

impl PairReplicator {
    pub async fn replicate(&self, task: CopyTask) -> PairResult {
        let span = info_span!(
            "pair",
            task_id = %task.task_id,
            destination = %task.destination.account,
            object = %task.object.name,
        );
        self.drive(task).instrument(span).await
    }

    async fn drive(&self, mut task: CopyTask) -> PairResult {
        let mut progress = TaskProgress::default();
        loop {
            let attempt_id = self.ids.generate_attempt_id();
            debug!(%attempt_id, ?progress, "attempt started");

            let (failure, observed_version) = match self.attempt(&mut task).await {
                Ok(polls) => {
                    task.finish(true);
                    info!(polls, "copy succeeded");
                    return result(&task, PairOutcome::Succeeded);
                }
                Err(failed) => failed,
            };

            match self.decider.decide(&progress, &failure) {
                Decision::Remint {
                    refresh_delegation,
                    reason,
                } => {
                    progress.remints += 1;
                    warn!(%reason, refresh_delegation, "minting a new authorization");
                    if !refresh_delegation {
                        continue;
                    }
                    if let Err(err) = self.cell.refresh(observed_version).await {
                        let kind = match err {
                            ReplicationError::Auth { .. } => ErrorKind::AuthError,
                            _ => ErrorKind::ExpiredDelegationError,
                        };
                        return give_up(&mut task, kind, format!("delegation refresh failed: {err}"));
                    }
                }
                Decision::RestartCopy { delay, reason } => {
                    progress.restarts += 1;
                    warn!(%reason, "restarting copy");
                    tokio::time::sleep(delay).await;
                }
                Decision::GiveUp { kind, reason } => return give_up(&mut task, kind, reason),
            }
        }
    }

    /// One mint + start + track cycle. On failure also returns the credential
    /// version the attempt used.
    async fn attempt(&self, task: &mut CopyTask) -> Result<u32, (AttemptFailure, u64)> {
        let credential = self.cell.current();
        let version = credential.version;

        let authorization = self
            .minter
            .mint(&credential, &task.object, Permission::Read, self.authorization_ttl)
            .map_err(|e| (AttemptFailure::Mint(e), version))?;

        let handle = self
            .initiator
            .start_copy(task.task_id, &task.object, &authorization, &task.destination)
            .await
            .map_err(|e| (AttemptFailure::CopyStart(e), version))?;
        task.mark_pending();

        match self.tracker.await_completion(&handle, &self.poll).await {
            TerminalStatus::Succeeded { polls } => Ok(polls),
            TerminalStatus::Failed {
                status,
                description,
            } => Err((
                AttemptFailure::CopyFailed {
                    status,
                    description,
                },
                version,
            )),
            TerminalStatus::TimedOut { waited, .. } => {
                Err((AttemptFailure::TimedOut { waited }, version))
            }
        }
    }
}

fn give_up(task: &mut CopyTask, kind: ErrorKind, message: String) -> PairResult {
    task.finish(false);
    warn!(%kind, %message, "pair failed");
    result(task, PairOutcome::Failed { kind, message })
}

fn result(task: &CopyTask, outcome: PairOutcome) -> PairResult {
    PairResult {
        destination: task.destination.account.clone(),
        object: task.object.clone(),
        outcome,
    }
}
