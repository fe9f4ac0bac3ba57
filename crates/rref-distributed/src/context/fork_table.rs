//! Per-RRef fork bookkeeping.

use rref_core::types::ForkId;
use std::collections::HashSet;

/// Live forks of one RRef, plus the forks already released.
///
/// A released fork is remembered so that an add overtaken by its delete is
/// dropped when it finally arrives. The table therefore ends in the same
/// state whatever order the add and delete of a fork are applied in.
///
/// Released ids are kept for as long as the table itself: one per fork ever
/// handed out for the RRef. The registry drops the whole table when it
/// evicts the owner entry.
#[derive(Debug, Clone, Default)]
pub struct ForkTable {
    live: HashSet<ForkId>,
    deleted: HashSet<ForkId>,
}

impl ForkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fork. Returns `false` when it was already live or has been
    /// released before.
    pub fn insert(&mut self, fork_id: ForkId) -> bool {
        if self.deleted.contains(&fork_id) {
            return false;
        }
        self.live.insert(fork_id)
    }

    /// Release a fork. Returns whether it was live.
    pub fn remove(&mut self, fork_id: ForkId) -> bool {
        self.deleted.insert(fork_id);
        self.live.remove(&fork_id)
    }

    pub fn contains(&self, fork_id: ForkId) -> bool {
        self.live.contains(&fork_id)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Snapshot of the live forks.
    pub fn live(&self) -> HashSet<ForkId> {
        self.live.clone()
    }
}
