//! # RRef Core
//!
//! Value types shared by every part of the distributed remote-reference
//! system:
//!
//! - **Identity**: [`WorkerId`], [`RRefId`] and [`ForkId`]. Ids embed the
//!   minting worker, so uniqueness needs no coordinator.
//! - **References**: the [`RRef`] variant: an [`OwnerRRef`] holding the value
//!   or a [`UserRRef`] pointing at a remote owner.
//! - **Messages**: [`Message`], [`MessageType`] and the [`RRefForkData`]
//!   payload exchanged for creation and fork accounting.
//!
//! ## Quick Start
//!
//! ```rust
//! use rref_core::prelude::*;
//!
//! let worker = WorkerId::new("trainer0", 0);
//! let rref_id = RRefId::next(worker.id());
//! assert_eq!(rref_id.created_on(), 0);
//!
//! // Ids that do not fit 16 bits are rejected.
//! assert!(WorkerId::try_new("ps", 32_768).is_err());
//! ```

pub mod error;
pub mod message;
pub mod prelude;
pub mod rref;
pub mod types;
