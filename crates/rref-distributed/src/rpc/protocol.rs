//! tarpc service trait definitions.
//!
//! Every worker serves one [`WorkerService`]. Messages travel as opaque
//! [`Message`] envelopes; the service only adds the sender's identity and the
//! barrier used by `sync`.

use crate::agent::RpcResult;
use rref_core::message::Message;
use rref_core::types::WorkerId;

/// Service provided by each worker.
#[tarpc::service]
pub trait WorkerService {
    /// Deliver a message to this worker's request handler.
    ///
    /// Returns the handler's reply. One-way messages yield `None`.
    async fn deliver(from: WorkerId, message: Message) -> RpcResult<Option<Message>>;

    /// Record that `worker` reached sync round `round`.
    async fn sync_arrive(worker: WorkerId, round: u64) -> RpcResult<()>;

    /// Health check. Returns the identity of the serving worker.
    async fn ping() -> WorkerId;
}
