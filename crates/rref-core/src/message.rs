//! Messages exchanged between workers.
//!
//! A [`Message`] is a typed envelope around an opaque byte payload. The RRef
//! payloads are JSON-encoded structs; transports never look inside them.

use crate::error::Result;
use crate::types::{ForkId, RRefId, WorkerId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    /// Tell the owner a user handle exists (carries fork data and, optionally,
    /// the value).
    RRefCreate,
    /// Register a fork at the owner.
    RRefAddFork,
    /// Release a fork at the owner.
    RRefDelFork,
    /// Ask the owner for the value.
    RRefFetch,
    /// Reply to [`MessageType::RRefFetch`].
    RRefFetchRet,
    /// Plain acknowledgement.
    Ack,
    /// The request failed on the remote side; the payload is the error text.
    Exception,
    /// One-way notice that the sender is going away.
    Shutdown,
}

impl MessageType {
    /// Whether the sender expects a reply.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            MessageType::RRefCreate
                | MessageType::RRefAddFork
                | MessageType::RRefDelFork
                | MessageType::RRefFetch
        )
    }

    pub fn is_response(self) -> bool {
        matches!(
            self,
            MessageType::RRefFetchRet | MessageType::Ack | MessageType::Exception
        )
    }
}

/// A message envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    message_type: MessageType,
    payload: Vec<u8>,
    id: i64,
}

impl Message {
    /// Create a message. The id is assigned by the sending agent.
    pub fn new(message_type: MessageType, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            payload,
            id: -1,
        }
    }

    /// Create a message whose payload is `body` encoded as JSON.
    pub fn encode<P: Serialize>(message_type: MessageType, body: &P) -> Result<Self> {
        Ok(Self::new(message_type, serde_json::to_vec(body)?))
    }

    pub fn ack() -> Self {
        Self::new(MessageType::Ack, Vec::new())
    }

    pub fn exception(text: impl Into<String>) -> Self {
        Self::new(MessageType::Exception, text.into().into_bytes())
    }

    pub fn shutdown() -> Self {
        Self::new(MessageType::Shutdown, Vec::new())
    }

    /// Decode the JSON payload.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn is_request(&self) -> bool {
        self.message_type.is_request()
    }

    pub fn is_response(&self) -> bool {
        self.message_type.is_response()
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn set_id(&mut self, id: i64) {
        self.id = id;
    }

    /// The error text of an [`MessageType::Exception`] message.
    pub fn exception_text(&self) -> Option<String> {
        (self.message_type == MessageType::Exception)
            .then(|| String::from_utf8_lossy(&self.payload).into_owned())
    }
}

/// The identity of one fork as transmitted between workers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RRefForkData {
    pub owner: WorkerId,
    pub rref_id: RRefId,
    pub fork_id: ForkId,
}

impl RRefForkData {
    pub fn new(owner: WorkerId, rref_id: RRefId, fork_id: ForkId) -> Self {
        Self {
            owner,
            rref_id,
            fork_id,
        }
    }

    /// Encode into an opaque payload.
    pub fn to_payload(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from an opaque payload.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::RRefError::InvalidPayload`] if the bytes are not
    /// an encoded fork.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Payload of an [`MessageType::RRefCreate`] message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RRefCreatePayload {
    pub fork: RRefForkData,
    /// The value, when the creator supplies it.
    pub value: Option<serde_json::Value>,
}
