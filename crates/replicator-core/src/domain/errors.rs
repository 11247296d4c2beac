//! Errors and their classification.
//!
//! Per-pair failures are recorded with an [`ErrorKind`] and never travel past
//! the worker that produced them. Only [`ReplicationError`] aborts a run.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::names::{AccountName, NameError};

/// Operational classification of a failed (object, destination) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The identity cannot obtain a delegation credential.
    AuthError,
    /// The delegation credential ran out and could not be renewed in time.
    ExpiredDelegationError,
    /// The server-side copy could not be started.
    CopyStartError,
    /// The copy did not reach a terminal state within the poll timeout.
    CompletionTimeoutError,
    /// The store reported the copy as failed or aborted.
    CopyFailedError,
    /// The destination container could not be prepared.
    DestinationUnavailableError,
    /// The run stopped (cancelled or run timeout) before the pair finished.
    CancelledError,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Failure reported by an object store port.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Network trouble, throttling, 5xx. Safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, StoreError::Unauthorized(_))
    }
}

/// Failure to mint a scoped authorization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MintError {
    #[error(
        "delegation credential cannot cover the requested ttl \
         (requested {requested:?}, remaining {remaining:?})"
    )]
    ExpiredDelegation {
        requested: Duration,
        remaining: Duration,
    },

    #[error("credential issued by `{credential}` cannot authorize objects of `{object}`")]
    ScopeMismatch {
        credential: AccountName,
        object: AccountName,
    },

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Why a copy could not be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CopyStartFailure {
    /// Bad destination or an authorization for a different object.
    Malformed,
    /// The destination container does not exist.
    DestinationMissing,
    /// The store rejected the embedded authorization.
    AuthorizationRejected,
    /// The authorization is (nearly) expired; mint a new one.
    AuthorizationExpired,
    /// Network or service trouble that outlived the retry budget.
    Transport,
}

/// Failure of the copy initiator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("copy start failed ({reason:?}, retryable={retryable}, attempts={attempts}): {message}")]
pub struct CopyStartError {
    pub reason: CopyStartFailure,
    pub retryable: bool,
    pub attempts: u32,
    pub message: String,
}

impl CopyStartError {
    pub fn new(reason: CopyStartFailure, attempts: u32, message: impl Into<String>) -> Self {
        let retryable = matches!(
            reason,
            CopyStartFailure::Transport | CopyStartFailure::AuthorizationExpired
        );
        Self {
            reason,
            retryable,
            attempts,
            message: message.into(),
        }
    }

    /// Whether a fresh authorization may fix this.
    pub fn needs_remint(&self) -> bool {
        matches!(
            self.reason,
            CopyStartFailure::AuthorizationExpired | CopyStartFailure::AuthorizationRejected
        )
    }
}

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("identity cannot obtain a delegation credential for `{account}`: {message}")]
    Auth {
        account: AccountName,
        message: String,
    },

    #[error("source container {target} is unavailable: {source}")]
    SourceUnavailable {
        target: String,
        #[source]
        source: StoreError,
    },

    #[error("delegation issuance failed: {0}")]
    Delegation(#[source] StoreError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Name(#[from] NameError),
}
