//! The transport contract RRefs are built on.
//!
//! An [`RpcAgent`] is one worker's endpoint: it sends messages without
//! blocking and hands every inbound message to a [`RequestHandler`]. It must
//! be ready to send and receive as soon as it is constructed. Handlers may be
//! invoked concurrently from any number of transport tasks.
//!
//! Two transports ship with this crate:
//!
//! - [`LocalAgent`] on a [`LocalNetwork`]: in-process mailboxes, used by tests
//!   and the demo.
//! - [`crate::rpc::TcpAgent`]: tarpc over TCP.

mod barrier;
mod local;

pub use barrier::SyncBarrier;
pub use local::{LocalAgent, LocalNetwork};

use async_trait::async_trait;
use rref_core::message::Message;
use rref_core::types::WorkerId;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{oneshot, Notify};

/// Result type for transport operations.
pub type RpcResult<T> = Result<T, RpcError>;

/// Serializable transport error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcError {
    /// No worker with this name or index is known.
    UnknownWorker(String),
    /// The message could not be delivered.
    Transport(String),
    /// The request was dropped without a reply.
    NoReply,
    /// The agent has been joined.
    Shutdown,
    /// A sync round did not complete in time.
    SyncTimeout(u64),
    /// Internal error.
    Internal(String),
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RpcError::UnknownWorker(name) => write!(f, "Unknown worker {}", name),
            RpcError::Transport(msg) => write!(f, "Transport failed: {}", msg),
            RpcError::NoReply => write!(f, "Request dropped without a reply"),
            RpcError::Shutdown => write!(f, "Agent is shut down"),
            RpcError::SyncTimeout(round) => write!(f, "Sync round {} timed out", round),
            RpcError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RpcError {}

/// Handles messages delivered to a worker.
///
/// Returning `Some` for a request routes the reply back to the sender. The
/// handler must not assume single-threaded delivery.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, from: &WorkerId, message: Message) -> Option<Message>;
}

/// One worker's message endpoint.
#[async_trait]
pub trait RpcAgent: Send + Sync {
    /// This agent's own identity.
    fn worker_id(&self) -> &WorkerId;

    /// Send `message` to `to`.
    ///
    /// Never blocks. For requests the returned future completes with the
    /// reply; for other messages it is advisory and may be dropped.
    fn send(&self, to: &WorkerId, message: Message) -> FutureMessage;

    /// Resolve a peer by name.
    fn get_worker_id(&self, name: &str) -> RpcResult<WorkerId>;

    /// Drain in-flight work and stop.
    async fn join(&self) -> RpcResult<()>;

    /// Block until every participating agent reaches `sync` and has flushed
    /// its pending sends.
    async fn sync(&self) -> RpcResult<()>;
}

/// Future of the reply to a sent message.
///
/// A peer that never answers leaves it pending; nothing at this layer times
/// it out.
#[derive(Debug)]
pub struct FutureMessage {
    state: FutureState,
}

#[derive(Debug)]
enum FutureState {
    Ready(Option<RpcResult<Message>>),
    Pending(oneshot::Receiver<RpcResult<Message>>),
}

impl FutureMessage {
    /// An already completed future.
    pub fn ready(result: RpcResult<Message>) -> Self {
        Self {
            state: FutureState::Ready(Some(result)),
        }
    }

    /// A pending future and the slot that completes it.
    pub fn pending() -> (ResponseSlot, Self) {
        let (tx, rx) = oneshot::channel();
        let slot = ResponseSlot {
            sender: tx,
            _guard: None,
        };
        (
            slot,
            Self {
                state: FutureState::Pending(rx),
            },
        )
    }

    /// Like [`FutureMessage::pending`], counting the send as in flight until
    /// the slot is completed or dropped.
    pub(crate) fn tracked(in_flight: &Arc<InFlight>) -> (ResponseSlot, Self) {
        let (mut slot, future) = Self::pending();
        slot._guard = Some(in_flight.begin());
        (slot, future)
    }

    /// Whether the reply (or an error) is available.
    pub fn is_completed(&mut self) -> bool {
        let polled = match &mut self.state {
            FutureState::Ready(_) => return true,
            FutureState::Pending(rx) => rx.try_recv(),
        };
        match polled {
            Ok(result) => {
                self.state = FutureState::Ready(Some(result));
                true
            }
            Err(oneshot::error::TryRecvError::Empty) => false,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.state = FutureState::Ready(Some(Err(RpcError::NoReply)));
                true
            }
        }
    }

    /// Wait for the reply.
    pub async fn wait(self) -> RpcResult<Message> {
        self.await
    }
}

impl Future for FutureMessage {
    type Output = RpcResult<Message>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            FutureState::Ready(result) => {
                Poll::Ready(result.take().unwrap_or(Err(RpcError::NoReply)))
            }
            FutureState::Pending(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(RpcError::NoReply))),
        }
    }
}

/// Completes a [`FutureMessage`].
#[derive(Debug)]
pub struct ResponseSlot {
    sender: oneshot::Sender<RpcResult<Message>>,
    _guard: Option<InFlightGuard>,
}

impl ResponseSlot {
    pub fn complete(self, result: RpcResult<Message>) {
        // The caller may have dropped its future.
        let _ = self.sender.send(result);
    }
}

/// Counter of sends that have not completed yet.
#[derive(Debug, Default)]
pub(crate) struct InFlight {
    count: AtomicUsize,
    drained: Notify,
}

impl InFlight {
    pub(crate) fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(Arc::clone(self))
    }

    pub(crate) fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Wait until no send is in flight.
    pub(crate) async fn drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

#[derive(Debug)]
pub(crate) struct InFlightGuard(Arc<InFlight>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.0.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_future() {
        let future = FutureMessage::ready(Ok(Message::ack()));
        assert_eq!(future.await.unwrap(), Message::ack());
    }

    #[tokio::test]
    async fn test_pending_future_completes() {
        let (slot, mut future) = FutureMessage::pending();
        assert!(!future.is_completed());

        slot.complete(Ok(Message::exception("remote")));
        assert!(future.is_completed());
        let reply = future.await.unwrap();
        assert_eq!(reply.exception_text().as_deref(), Some("remote"));
    }

    #[tokio::test]
    async fn test_dropped_slot_reports_no_reply() {
        let (slot, future) = FutureMessage::pending();
        drop(slot);
        assert_eq!(future.await, Err(RpcError::NoReply));
    }

    #[tokio::test]
    async fn test_unanswered_future_stays_pending() {
        let (_slot, future) = FutureMessage::pending();
        let result = tokio::time::timeout(Duration::from_millis(20), future).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_in_flight_drains() {
        let in_flight = Arc::new(InFlight::default());
        let (slot, _future) = FutureMessage::tracked(&in_flight);
        assert_eq!(in_flight.count(), 1);

        let waiter = {
            let in_flight = in_flight.clone();
            tokio::spawn(async move { in_flight.drained().await })
        };
        slot.complete(Ok(Message::ack()));

        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(in_flight.count(), 0);
    }

    #[test]
    fn test_rpc_error_display() {
        assert_eq!(RpcError::UnknownWorker("w9".into()).to_string(), "Unknown worker w9");
        assert_eq!(RpcError::SyncTimeout(3).to_string(), "Sync round 3 timed out");
    }
}
