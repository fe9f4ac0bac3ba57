//! Convenience re-exports.
//!
//! ```rust
//! use rref_core::prelude::*;
//! ```

pub use crate::error::{RRefError, Result};
pub use crate::message::{Message, MessageType, RRefCreatePayload, RRefForkData};
pub use crate::rref::{OwnerRRef, RRef, UserRRef};
pub use crate::types::{ForkId, GloballyUniqueId, RRefId, WorkerId, WorkerIndex};
