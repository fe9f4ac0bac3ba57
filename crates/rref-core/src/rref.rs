//! Remote reference variants.
//!
//! An [`RRef`] is either the owner's entry, which holds the value, or a user
//! handle, which only knows where the value lives. The two cases differ in
//! nothing else, so they are a plain enum rather than a trait hierarchy.

use crate::error::{RRefError, Result};
use crate::message::RRefForkData;
use crate::types::{ForkId, RRefId, WorkerId, WorkerIndex};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, OnceLock};
use tokio::sync::Notify;

/// The owner-side entry of a remote reference.
///
/// The value slot starts empty when the entry was materialized from a fork
/// message that overtook the creation message, and is filled exactly once.
pub struct OwnerRRef<T> {
    owner: WorkerIndex,
    rref_id: RRefId,
    value: OnceLock<T>,
    ready: Notify,
}

impl<T> OwnerRRef<T> {
    /// Create an owner entry whose value is not known yet.
    pub fn new(owner: WorkerIndex, rref_id: RRefId) -> Self {
        Self {
            owner,
            rref_id,
            value: OnceLock::new(),
            ready: Notify::new(),
        }
    }

    /// Create an owner entry holding `value`.
    pub fn with_value(owner: WorkerIndex, rref_id: RRefId, value: T) -> Self {
        let rref = Self::new(owner, rref_id);
        let _ = rref.value.set(value);
        rref
    }

    pub fn id(&self) -> RRefId {
        self.rref_id
    }

    pub fn owner_id(&self) -> WorkerIndex {
        self.owner
    }

    /// Populate the value.
    ///
    /// # Errors
    ///
    /// Returns [`RRefError::ValueAlreadySet`] if the value was populated
    /// before; the stored value is left untouched.
    pub fn set_value(&self, value: T) -> Result<()> {
        self.value
            .set(value)
            .map_err(|_| RRefError::ValueAlreadySet(self.rref_id))?;
        self.ready.notify_waiters();
        Ok(())
    }

    /// The value, if it has been populated.
    pub fn value(&self) -> Option<&T> {
        self.value.get()
    }

    /// Wait until the value is populated.
    pub async fn wait_value(&self) -> &T {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.value.get() {
                return value;
            }
            notified.await;
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for OwnerRRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OwnerRRef")
            .field("owner", &self.owner)
            .field("rref_id", &self.rref_id)
            .field("value", &self.value.get())
            .finish()
    }
}

/// A handle to a value owned by another worker.
///
/// Holds identity only. Dropping it has no side effect; releasing the fork
/// at the owner is an explicit message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRRef {
    owner: WorkerId,
    rref_id: RRefId,
    fork_id: ForkId,
}

impl UserRRef {
    pub fn new(owner: WorkerId, rref_id: RRefId, fork_id: ForkId) -> Self {
        Self {
            owner,
            rref_id,
            fork_id,
        }
    }

    pub fn owner(&self) -> &WorkerId {
        &self.owner
    }

    pub fn id(&self) -> RRefId {
        self.rref_id
    }

    pub fn fork_id(&self) -> ForkId {
        self.fork_id
    }

    /// The identity triple transmitted to the owner for this fork.
    pub fn fork_data(&self) -> RRefForkData {
        RRefForkData::new(self.owner.clone(), self.rref_id, self.fork_id)
    }
}

/// A distributed reference: either the owner's entry or a user handle.
pub enum RRef<T> {
    Owner(Arc<OwnerRRef<T>>),
    User(UserRRef),
}

impl<T> RRef<T> {
    pub fn is_owner(&self) -> bool {
        matches!(self, RRef::Owner(_))
    }

    pub fn id(&self) -> RRefId {
        match self {
            RRef::Owner(owner) => owner.id(),
            RRef::User(user) => user.id(),
        }
    }

    pub fn owner_id(&self) -> WorkerIndex {
        match self {
            RRef::Owner(owner) => owner.owner_id(),
            RRef::User(user) => user.owner().id(),
        }
    }

    /// The fork id of a user handle; owners have none.
    pub fn fork_id(&self) -> Option<ForkId> {
        match self {
            RRef::Owner(_) => None,
            RRef::User(user) => Some(user.fork_id()),
        }
    }

    pub fn as_owner(&self) -> Option<&Arc<OwnerRRef<T>>> {
        match self {
            RRef::Owner(owner) => Some(owner),
            RRef::User(_) => None,
        }
    }

    pub fn as_user(&self) -> Option<&UserRRef> {
        match self {
            RRef::Owner(_) => None,
            RRef::User(user) => Some(user),
        }
    }

    pub fn into_user(self) -> Option<UserRRef> {
        match self {
            RRef::Owner(_) => None,
            RRef::User(user) => Some(user),
        }
    }
}

impl<T> Clone for RRef<T> {
    fn clone(&self) -> Self {
        match self {
            RRef::Owner(owner) => RRef::Owner(Arc::clone(owner)),
            RRef::User(user) => RRef::User(user.clone()),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for RRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRef::Owner(owner) => f.debug_tuple("Owner").field(owner).finish(),
            RRef::User(user) => f.debug_tuple("User").field(user).finish(),
        }
    }
}
