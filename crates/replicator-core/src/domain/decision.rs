//! Decision model: what to do after one attempt of a copy task failed.
//!
//! The decider is a pure function of the task's progress and the failure it
//! just saw. Executing the decision (refreshing the credential, sleeping,
//! recording the failure) is left to the worker.

use std::time::Duration;

use super::errors::{CopyStartError, CopyStartFailure, ErrorKind, MintError};
use crate::app::retry::RetryPolicy;

/// What went wrong in the latest attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptFailure {
    Mint(MintError),
    CopyStart(CopyStartError),
    CopyFailed {
        status: String,
        description: Option<String>,
    },
    TimedOut {
        waited: Duration,
    },
}

impl AttemptFailure {
    pub fn message(&self) -> String {
        match self {
            AttemptFailure::Mint(e) => e.to_string(),
            AttemptFailure::CopyStart(e) => e.to_string(),
            AttemptFailure::CopyFailed {
                status,
                description: Some(d),
            } => format!("copy status `{status}`: {d}"),
            AttemptFailure::CopyFailed { status, .. } => format!("copy status `{status}`"),
            AttemptFailure::TimedOut { waited } => {
                format!("no terminal copy status after {waited:?}")
            }
        }
    }
}

/// Counters the decider looks at.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskProgress {
    /// Authorizations minted so far for this task beyond the first.
    pub remints: u32,
    /// Copies restarted after a completion timeout.
    pub restarts: u32,
}

/// The next action for a copy task.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Mint a new authorization and start the copy again.
    Remint {
        /// Replace the delegation credential first.
        refresh_delegation: bool,
        reason: String,
    },

    /// Start the copy again after a delay.
    RestartCopy { delay: Duration, reason: String },

    /// Record the task as failed.
    GiveUp { kind: ErrorKind, reason: String },
}

/// Trait for deciding the next action after a failed attempt.
pub trait Decider: Send + Sync {
    fn decide(&self, progress: &TaskProgress, failure: &AttemptFailure) -> Decision;
}

/// Re-mint on authorization trouble, restart timed-out copies only when
/// configured to, give up on everything else.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    max_remints: u32,
    completion_retries: u32,
    restart_policy: RetryPolicy,
}

impl DefaultDecider {
    pub fn new(max_remints: u32, completion_retries: u32, restart_policy: RetryPolicy) -> Self {
        Self {
            max_remints,
            completion_retries,
            restart_policy,
        }
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, progress: &TaskProgress, failure: &AttemptFailure) -> Decision {
        let give_up = |kind: ErrorKind| Decision::GiveUp {
            kind,
            reason: failure.message(),
        };

        match failure {
            AttemptFailure::Mint(MintError::ExpiredDelegation { .. }) => {
                if progress.remints < self.max_remints {
                    Decision::Remint {
                        refresh_delegation: true,
                        reason: failure.message(),
                    }
                } else {
                    give_up(ErrorKind::ExpiredDelegationError)
                }
            }
            AttemptFailure::Mint(_) => give_up(ErrorKind::AuthError),
            AttemptFailure::CopyStart(e) if e.needs_remint() => {
                if progress.remints < self.max_remints {
                    Decision::Remint {
                        // a rejected token may mean the delegation key was revoked
                        refresh_delegation: e.reason == CopyStartFailure::AuthorizationRejected,
                        reason: failure.message(),
                    }
                } else if e.reason == CopyStartFailure::AuthorizationExpired {
                    give_up(ErrorKind::ExpiredDelegationError)
                } else {
                    give_up(ErrorKind::CopyStartError)
                }
            }
            AttemptFailure::CopyStart(_) => give_up(ErrorKind::CopyStartError),
            AttemptFailure::CopyFailed { .. } => give_up(ErrorKind::CopyFailedError),
            AttemptFailure::TimedOut { .. } => {
                if progress.restarts < self.completion_retries {
                    let delay = self.restart_policy.next_delay(progress.restarts + 1);
                    Decision::RestartCopy {
                        delay,
                        reason: format!(
                            "restart {}/{} after {:?}: {}",
                            progress.restarts + 1,
                            self.completion_retries,
                            delay,
                            failure.message()
                        ),
                    }
                } else {
                    give_up(ErrorKind::CompletionTimeoutError)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn decider(max_remints: u32, completion_retries: u32) -> DefaultDecider {
        DefaultDecider::new(
            max_remints,
            completion_retries,
            RetryPolicy::new(Duration::from_secs(1), 2.0, 3),
        )
    }

    fn expired() -> AttemptFailure {
        AttemptFailure::Mint(MintError::ExpiredDelegation {
            requested: Duration::from_secs(900),
            remaining: Duration::from_secs(10),
        })
    }

    #[test]
    fn expired_delegation_refreshes_then_gives_up() {
        let d = decider(1, 0);

        let first = d.decide(&TaskProgress::default(), &expired());
        assert!(matches!(
            first,
            Decision::Remint {
                refresh_delegation: true,
                ..
            }
        ));

        let exhausted = TaskProgress {
            remints: 1,
            restarts: 0,
        };
        assert!(matches!(
            d.decide(&exhausted, &expired()),
            Decision::GiveUp {
                kind: ErrorKind::ExpiredDelegationError,
                ..
            }
        ));
    }

    #[rstest]
    #[case::rejected(CopyStartFailure::AuthorizationRejected, true)]
    #[case::expired(CopyStartFailure::AuthorizationExpired, false)]
    fn authorization_failures_remint(#[case] reason: CopyStartFailure, #[case] refresh: bool) {
        let d = decider(2, 0);
        let failure = AttemptFailure::CopyStart(CopyStartError::new(reason, 1, "auth"));
        assert_eq!(
            d.decide(&TaskProgress::default(), &failure),
            Decision::Remint {
                refresh_delegation: refresh,
                reason: failure.message(),
            }
        );
    }

    #[rstest]
    #[case::transport(CopyStartFailure::Transport)]
    #[case::missing(CopyStartFailure::DestinationMissing)]
    #[case::malformed(CopyStartFailure::Malformed)]
    fn other_copy_start_failures_give_up(#[case] reason: CopyStartFailure) {
        let d = decider(2, 2);
        let failure = AttemptFailure::CopyStart(CopyStartError::new(reason, 4, "nope"));
        assert!(matches!(
            d.decide(&TaskProgress::default(), &failure),
            Decision::GiveUp {
                kind: ErrorKind::CopyStartError,
                ..
            }
        ));
    }

    #[test]
    fn timeout_is_reported_unless_restarts_are_configured() {
        let timed_out = AttemptFailure::TimedOut {
            waited: Duration::from_secs(5),
        };

        assert!(matches!(
            decider(2, 0).decide(&TaskProgress::default(), &timed_out),
            Decision::GiveUp {
                kind: ErrorKind::CompletionTimeoutError,
                ..
            }
        ));

        let d = decider(2, 1);
        assert!(matches!(
            d.decide(&TaskProgress::default(), &timed_out),
            Decision::RestartCopy { delay, .. } if delay == Duration::from_secs(1)
        ));
        let restarted = TaskProgress {
            remints: 0,
            restarts: 1,
        };
        assert!(matches!(
            d.decide(&restarted, &timed_out),
            Decision::GiveUp {
                kind: ErrorKind::CompletionTimeoutError,
                ..
            }
        ));
    }

    #[test]
    fn copy_failure_keeps_status_in_message() {
        let failure = AttemptFailure::CopyFailed {
            status: "aborted".into(),
            description: Some("aborted by user".into()),
        };
        match decider(2, 2).decide(&TaskProgress::default(), &failure) {
            Decision::GiveUp { kind, reason } => {
                assert_eq!(kind, ErrorKind::CopyFailedError);
                assert!(reason.contains("aborted"));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }
}
