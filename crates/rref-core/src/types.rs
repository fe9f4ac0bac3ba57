//! Identity types for workers and remote references.
//!
//! Every id pairs the index of the worker that minted it with a value drawn
//! from a process-wide atomic counter. Two workers never share an index, so
//! ids are globally unique without any cross-worker coordination.

use crate::error::{RRefError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Numeric index of a worker in the cluster.
pub type WorkerIndex = i16;

/// Counter shared by every id minted in this process.
static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(0);

/// Globally unique identity of one cluster participant.
///
/// The name is the human-facing handle (`"trainer3"`, `"ps0"`); the index is
/// what ids embed and what messages carry. Both are unique in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId {
    name: String,
    id: WorkerIndex,
}

impl WorkerId {
    /// Create a worker identity from an index that already fits 16 bits.
    pub fn new(name: impl Into<String>, id: WorkerIndex) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Create a worker identity from a wider integer.
    ///
    /// # Errors
    ///
    /// Returns [`RRefError::WorkerIdOutOfRange`] if `id` does not fit in an
    /// `i16`.
    pub fn try_new(name: impl Into<String>, id: i64) -> Result<Self> {
        let id = WorkerIndex::try_from(id).map_err(|_| RRefError::WorkerIdOutOfRange(id))?;
        Ok(Self::new(name, id))
    }

    /// The worker's unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The worker's unique index.
    pub fn id(&self) -> WorkerIndex {
        self.id
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Shape shared by [`RRefId`] and [`ForkId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GloballyUniqueId {
    /// Index of the worker that minted the id.
    pub created_on: WorkerIndex,
    /// Value of the minting process's counter.
    pub local_id: u64,
}

impl GloballyUniqueId {
    pub const fn new(created_on: WorkerIndex, local_id: u64) -> Self {
        Self {
            created_on,
            local_id,
        }
    }

    /// Mint a fresh id on behalf of `created_on`.
    pub fn next(created_on: WorkerIndex) -> Self {
        Self::new(created_on, NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for GloballyUniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GloballyUniqueId(created_on={}, local_id={})",
            self.created_on, self.local_id
        )
    }
}

macro_rules! unique_id {
    ($(#[$meta:meta])* $name:ident, $tag:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(GloballyUniqueId);

        impl $name {
            pub const fn new(created_on: WorkerIndex, local_id: u64) -> Self {
                Self(GloballyUniqueId::new(created_on, local_id))
            }

            /// Mint a fresh id on behalf of `created_on`.
            pub fn next(created_on: WorkerIndex) -> Self {
                Self(GloballyUniqueId::next(created_on))
            }

            /// Index of the worker that minted this id.
            pub fn created_on(&self) -> WorkerIndex {
                self.0.created_on
            }

            pub fn local_id(&self) -> u64 {
                self.0.local_id
            }
        }

        impl From<GloballyUniqueId> for $name {
            fn from(id: GloballyUniqueId) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({}, {})", $tag, self.0.created_on, self.0.local_id)
            }
        }
    };
}

unique_id!(
    /// Identity of a remote reference.
    ///
    /// Minted by the worker that created the reference; `created_on` is that
    /// worker, which is not necessarily the owner.
    RRefId,
    "RRefId"
);

unique_id!(
    /// Identity of one outstanding copy (fork) of a remote reference.
    ///
    /// Minted by the owner when handing a reference to its first user, or by
    /// a user forwarding the reference to another user.
    ForkId,
    "ForkId"
);

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_worker_id_bounds() {
        assert!(WorkerId::try_new("w", 32_767).is_ok());
        assert_eq!(
            WorkerId::try_new("w", 32_768),
            Err(RRefError::WorkerIdOutOfRange(32_768))
        );
        assert!(WorkerId::try_new("w", -32_768).is_ok());
        assert!(WorkerId::try_new("w", -32_769).is_err());
    }

    #[test]
    fn test_worker_id_display() {
        let worker = WorkerId::new("ps0", 3);
        assert_eq!(worker.name(), "ps0");
        assert_eq!(worker.id(), 3);
        assert_eq!(format!("{}", worker), "ps0#3");
    }

    #[test]
    fn test_ids_embed_minting_worker() {
        let rref = RRefId::next(4);
        let fork = ForkId::next(9);
        assert_eq!(rref.created_on(), 4);
        assert_eq!(fork.created_on(), 9);
        assert_ne!(rref.local_id(), fork.local_id());
    }

    #[test]
    fn test_same_counter_different_worker_differs() {
        let a = RRefId::new(0, 7);
        let b = RRefId::new(1, 7);
        assert_ne!(a, b);
        assert_eq!(a, RRefId::new(0, 7));
    }

    #[test]
    fn test_concurrent_minting_never_repeats() {
        let handles: Vec<_> = (0..8)
            .map(|_| std::thread::spawn(|| (0..1000).map(|_| RRefId::next(0)).collect::<Vec<_>>()))
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for id in handle.join().unwrap() {
                assert!(seen.insert(id), "duplicate id {}", id);
            }
        }
        assert_eq!(seen.len(), 8000);
    }

    #[test]
    fn test_id_display() {
        assert_eq!(format!("{}", RRefId::new(0, 7)), "RRefId(0, 7)");
        assert_eq!(format!("{}", ForkId::new(1, 3)), "ForkId(1, 3)");
        assert_eq!(
            format!("{}", GloballyUniqueId::new(2, 5)),
            "GloballyUniqueId(created_on=2, local_id=5)"
        );
    }
}
