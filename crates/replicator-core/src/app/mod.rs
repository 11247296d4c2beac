//! App - replication services built on the ports.
//!
//! # Components
//! - **DelegationProvider / DelegationCell**: run credential and its refresh
//! - **AuthorizationMinter**: per-object read tokens
//! - **CopyInitiator**: server-side copy start with in-place retries
//! - **CompletionTracker**: copy status polling with backoff
//! - **PairReplicator**: mint, start, track and decide for one pair
//! - **WorkerPool**: bounded workers over a shared queue
//! - **Aggregator**: exactly-once result collection
//! - **Replicator**: the whole run

pub mod aggregator;
pub mod cancel;
pub mod delegation;
pub mod initiator;
pub mod minter;
pub mod orchestrator;
pub mod pair;
pub mod retry;
pub mod tracker;
pub mod worker_pool;

pub use self::aggregator::{Aggregator, PairOutcome, PairResult};
pub use self::cancel::{CancelHandle, CancelSignal};
pub use self::delegation::{DelegationCell, DelegationProvider, VersionedCredential};
pub use self::initiator::CopyInitiator;
pub use self::minter::{AuthorizationMinter, TtlOverflow};
pub use self::orchestrator::{BuildError, ReplicationRequest, Replicator, ReplicatorBuilder};
pub use self::pair::PairReplicator;
pub use self::retry::RetryPolicy;
pub use self::tracker::{CompletionTracker, PollPolicy};
pub use self::worker_pool::{WorkQueue, WorkerPool};
