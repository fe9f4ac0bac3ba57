//! In-process transport.
//!
//! A [`LocalNetwork`] is a registry of worker mailboxes living in one
//! process. Each [`LocalAgent`] drains its mailbox on a dispatcher task that
//! runs every inbound message on its own task, so handlers see the same
//! concurrent delivery a network transport would produce.

use crate::agent::{FutureMessage, InFlight, RequestHandler, ResponseSlot, RpcAgent, RpcError, RpcResult, SyncBarrier};
use async_trait::async_trait;
use rref_core::message::Message;
use rref_core::types::WorkerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

struct Envelope {
    from: WorkerId,
    message: Message,
    reply: Option<ResponseSlot>,
}

type Mailbox = mpsc::UnboundedSender<Envelope>;

/// Shared in-process network.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct LocalNetwork {
    inner: Arc<NetworkInner>,
}

struct NetworkInner {
    mailboxes: RwLock<HashMap<String, (WorkerId, Mailbox)>>,
    barrier: SyncBarrier,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(NetworkInner {
                mailboxes: RwLock::new(HashMap::new()),
                barrier: SyncBarrier::new(0),
            }),
        }
    }

    /// Names of the workers currently attached.
    pub fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.read().keys().cloned().collect();
        names.sort();
        names
    }

    pub fn worker_count(&self) -> usize {
        self.read().len()
    }

    fn register(&self, worker: &WorkerId, mailbox: Mailbox) -> RpcResult<()> {
        let count = {
            let mut mailboxes = self
                .inner
                .mailboxes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if mailboxes.contains_key(worker.name())
                || mailboxes.values().any(|(w, _)| w.id() == worker.id())
            {
                return Err(RpcError::Internal(format!(
                    "worker {} is already attached",
                    worker
                )));
            }
            mailboxes.insert(worker.name().to_string(), (worker.clone(), mailbox));
            mailboxes.len()
        };
        self.inner.barrier.set_participants(count);
        Ok(())
    }

    fn unregister(&self, worker: &WorkerId) {
        let count = {
            let mut mailboxes = self
                .inner
                .mailboxes
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            mailboxes.remove(worker.name());
            mailboxes.len()
        };
        self.inner.barrier.set_participants(count);
    }

    fn lookup(&self, name: &str) -> Option<(WorkerId, Mailbox)> {
        self.read().get(name).cloned()
    }

    fn barrier(&self) -> &SyncBarrier {
        &self.inner.barrier
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, (WorkerId, Mailbox)>> {
        self.inner
            .mailboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for LocalNetwork {
    fn default() -> Self {
        Self::new()
    }
}

/// An [`RpcAgent`] attached to a [`LocalNetwork`].
pub struct LocalAgent {
    worker_id: WorkerId,
    network: LocalNetwork,
    in_flight: Arc<InFlight>,
    next_message_id: AtomicI64,
    sync_round: AtomicU64,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalAgent {
    /// Attach a worker to `network` and start dispatching to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Fails if a worker with the same name or index is already attached.
    pub fn spawn(
        worker_id: WorkerId,
        handler: Arc<dyn RequestHandler>,
        network: &LocalNetwork,
    ) -> RpcResult<Arc<Self>> {
        let (tx, rx) = mpsc::unbounded_channel();
        network.register(&worker_id, tx)?;

        let dispatcher = tokio::spawn(dispatch(worker_id.clone(), rx, handler));
        info!("Worker {} attached to local network", worker_id);

        Ok(Arc::new(Self {
            worker_id,
            network: network.clone(),
            in_flight: Arc::new(InFlight::default()),
            next_message_id: AtomicI64::new(0),
            sync_round: AtomicU64::new(0),
            dispatcher: Mutex::new(Some(dispatcher)),
        }))
    }

    /// Number of sent requests still waiting for a reply.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }
}

#[async_trait]
impl RpcAgent for LocalAgent {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn send(&self, to: &WorkerId, mut message: Message) -> FutureMessage {
        message.set_id(self.next_message_id.fetch_add(1, Ordering::Relaxed));

        let Some((_, mailbox)) = self.network.lookup(to.name()) else {
            warn!("{} cannot reach unknown worker {}", self.worker_id, to);
            return FutureMessage::ready(Err(RpcError::UnknownWorker(to.to_string())));
        };

        let (reply, future) = if message.is_request() {
            let (slot, future) = FutureMessage::tracked(&self.in_flight);
            (Some(slot), future)
        } else {
            (None, FutureMessage::ready(Ok(Message::ack())))
        };

        let envelope = Envelope {
            from: self.worker_id.clone(),
            message,
            reply,
        };
        if let Err(mpsc::error::SendError(envelope)) = mailbox.send(envelope) {
            debug!("Mailbox of {} is closed", to);
            if let Some(slot) = envelope.reply {
                slot.complete(Err(RpcError::Shutdown));
            }
        }
        future
    }

    fn get_worker_id(&self, name: &str) -> RpcResult<WorkerId> {
        self.network
            .lookup(name)
            .map(|(worker, _)| worker)
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))
    }

    async fn join(&self) -> RpcResult<()> {
        self.in_flight.drained().await;
        self.network.unregister(&self.worker_id);

        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(dispatcher) = dispatcher {
            dispatcher
                .await
                .map_err(|e| RpcError::Internal(e.to_string()))?;
            info!("Worker {} left local network", self.worker_id);
        }
        Ok(())
    }

    async fn sync(&self) -> RpcResult<()> {
        self.in_flight.drained().await;
        let round = self.sync_round.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} reached sync round {}", self.worker_id, round);

        let barrier = self.network.barrier();
        barrier.arrive(self.worker_id.id(), round);
        barrier.wait_all(round).await
    }
}

/// Drain a mailbox until every sender is gone, then wait for running
/// handlers.
async fn dispatch(
    worker: WorkerId,
    mut inbox: mpsc::UnboundedReceiver<Envelope>,
    handler: Arc<dyn RequestHandler>,
) {
    let mut running = JoinSet::new();
    loop {
        tokio::select! {
            envelope = inbox.recv() => match envelope {
                Some(envelope) => {
                    running.spawn(handle_envelope(handler.clone(), envelope));
                }
                None => break,
            },
            Some(_) = running.join_next(), if !running.is_empty() => {}
        }
    }
    while running.join_next().await.is_some() {}
    debug!("Dispatcher of {} stopped", worker);
}

async fn handle_envelope(handler: Arc<dyn RequestHandler>, envelope: Envelope) {
    let Envelope {
        from,
        message,
        reply,
    } = envelope;
    let response = handler.handle(&from, message).await;
    if let Some(slot) = reply {
        slot.complete(response.ok_or(RpcError::NoReply));
    }
}
