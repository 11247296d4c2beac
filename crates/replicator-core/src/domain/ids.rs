//! Domain identifiers (strongly-typed IDs).
//!
//! All ids are ULIDs wrapped in a phantom-typed `Id<T>`: one implementation,
//! but `RunId` and `TaskId` cannot be mixed up at compile time. ULIDs sort by
//! creation time, which keeps log lines and reports in a natural order.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Marker trait providing the display prefix of each id type.
pub trait IdMarker: Send + Sync + 'static {
    fn prefix() -> &'static str;
}

/// Generic id. `T` only exists at compile time.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// Markers
// ========================================

/// Replication run marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Run {}

impl IdMarker for Run {
    fn prefix() -> &'static str {
        "run-"
    }
}

/// Copy task marker (one per (object, destination) pair).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Task {}

impl IdMarker for Task {
    fn prefix() -> &'static str {
        "task-"
    }
}

/// Copy attempt marker (one per mint + start + track cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attempt {}

impl IdMarker for Attempt {
    fn prefix() -> &'static str {
        "attempt-"
    }
}

/// Identifier of a replication run.
pub type RunId = Id<Run>;

/// Identifier of a copy task.
pub type TaskId = Id<Task>;

/// Identifier of one attempt of a copy task.
pub type AttemptId = Id<Attempt>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_their_prefix() {
        let run = RunId::from_ulid(Ulid::new());
        let task = TaskId::from_ulid(Ulid::new());
        let attempt = AttemptId::from_ulid(Ulid::new());

        assert!(run.to_string().starts_with("run-"));
        assert!(task.to_string().starts_with("task-"));
        assert!(attempt.to_string().starts_with("attempt-"));

        // let _: RunId = task; // <- does not compile
    }

    #[test]
    fn ulid_ids_are_sortable() {
        let id1 = TaskId::from_ulid(Ulid::new());
        std::thread::sleep(std::time::Duration::from_millis(2));
        let id2 = TaskId::from_ulid(Ulid::new());

        assert!(id1 < id2);
    }

    #[test]
    fn ids_serialize_as_plain_ulid_strings() {
        let ulid = Ulid::new();
        let run_id = RunId::from_ulid(ulid);

        let s = serde_json::to_string(&run_id).unwrap();
        assert_eq!(s, format!("\"{ulid}\""));

        let back: RunId = serde_json::from_str(&s).unwrap();
        assert_eq!(back, run_id);
    }

    #[test]
    fn phantom_data_does_not_consume_memory() {
        use std::mem::size_of;
        assert_eq!(size_of::<TaskId>(), size_of::<Ulid>());
    }
}
