//! Domain model (ids, names, credentials, copy tasks, errors, reports).

pub mod copy;
pub mod credential;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod names;
pub mod report;

pub use copy::{
    CopyHandle, CopyStatus, CopyStatusReport, CopyTask, CopyTaskHandle, CopyTaskState,
    TerminalStatus,
};
pub use credential::{
    DelegationCredential, DelegationKey, Permission, SasToken, ScopedAuthorization,
    ValidityWindow,
};
pub use decision::{AttemptFailure, Decider, Decision, DefaultDecider, TaskProgress};
pub use errors::{
    CopyStartError, CopyStartFailure, ErrorKind, MintError, ReplicationError, StoreError,
};
pub use ids::{AttemptId, RunId, TaskId};
pub use names::{AccountName, ContainerHandle, ContainerName, NameError, ObjectIdentity};
pub use report::{DestinationReport, FailedObject, PopulateFailure, ReplicationReport, StopReason};
