//! Error types for RRef operations.
//!
//! Every variant is a protocol or programming error: it fails the offending
//! call immediately and is never retried.

use crate::types::{RRefId, WorkerIndex};
use std::error::Error;
use std::fmt;

/// Result type for RRef operations.
pub type Result<T> = std::result::Result<T, RRefError>;

/// Errors raised by identity construction and RRef bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RRefError {
    /// A worker id does not fit the 16-bit worker index.
    WorkerIdOutOfRange(i64),
    /// A worker tried to build a user handle for an RRef it owns itself.
    OwnerCreatesUser(WorkerIndex),
    /// A fork or creation message reached a worker that is not the owner.
    NotOwner {
        rref_id: RRefId,
        owner: WorkerIndex,
        worker: WorkerIndex,
    },
    /// A transmitted payload could not be decoded.
    InvalidPayload(String),
    /// The owner's value was already populated.
    ValueAlreadySet(RRefId),
    /// No owner entry exists for the id.
    UnknownRRef(RRefId),
}

impl fmt::Display for RRefError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RRefError::WorkerIdOutOfRange(id) => {
                write!(f, "RPC worker id {} out of bound of int16_t", id)
            }
            RRefError::OwnerCreatesUser(owner) => {
                write!(f, "RRef owner {} cannot create user RRef", owner)
            }
            RRefError::NotOwner {
                rref_id,
                owner,
                worker,
            } => write!(
                f,
                "{} is owned by worker {}, not by worker {}",
                rref_id, owner, worker
            ),
            RRefError::InvalidPayload(msg) => write!(f, "Invalid payload: {}", msg),
            RRefError::ValueAlreadySet(id) => write!(f, "Value of {} is already set", id),
            RRefError::UnknownRRef(id) => write!(f, "Unknown RRef: {}", id),
        }
    }
}

impl Error for RRefError {}

impl From<serde_json::Error> for RRefError {
    fn from(e: serde_json::Error) -> Self {
        RRefError::InvalidPayload(e.to_string())
    }
}
