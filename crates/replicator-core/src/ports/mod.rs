//! Ports - traits for everything outside the process.
//!
//! The object store, the delegation issuer, the clock and id generation are
//! injected so that the replication logic can run against the in-memory
//! store in tests and against a real service in production.

pub mod clock;
pub mod id_generator;
pub mod object_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::object_store::{DelegationIssuer, ObjectStore, TokenSigner};
