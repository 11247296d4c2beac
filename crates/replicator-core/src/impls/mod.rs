//! Impls - port implementations that need no network.
//!
//! # Included
//! - **UserDelegationSigner**: user delegation SAS signing and verification
//! - **InMemoryObjectStore**: multi-account store for tests and dry runs
//!
//! The Azure Blob Storage backend lives in the `replicator-azure` crate.

pub mod memory_store;
pub mod sas;

pub use self::memory_store::{CopyBehavior, InMemoryObjectStore};
pub use self::sas::{SAS_VERSION, SasVerifyError, UserDelegationSigner};
