//! replicator-core
//!
//! Replicates every object of a source container to the same container name
//! in a set of destination accounts, using server-side copies authorized by
//! short-lived, object-scoped tokens derived from a delegation credential.
//!
//! # Modules
//! - **domain**: names, credentials, copy tasks, errors, reports
//! - **ports**: object store, delegation issuer, token signer, clock, ids
//! - **app**: delegation, minting, copy start, tracking, worker pool, run
//! - **impls**: SAS signer and in-memory object store
//! - **config**: run configuration

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{CancelHandle, CancelSignal, ReplicationRequest, Replicator, ReplicatorBuilder};
pub use config::ReplicationConfig;
