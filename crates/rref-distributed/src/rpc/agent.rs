//! [`RpcAgent`] over tarpc.
//!
//! Each worker runs a [`WorkerServer`] on its directory address and reaches
//! peers through a [`WorkerClientPool`]. Sends are spawned on the runtime the
//! agent was started on and return at once.

use crate::agent::{FutureMessage, InFlight, RequestHandler, RpcAgent, RpcError, RpcResult, SyncBarrier};
use crate::rpc::client::{ClientConfig, WorkerClientPool};
use crate::rpc::server::WorkerServer;
use crate::types::{DistributedConfig, DistributedError, DistributedResult, WorkerDirectory};
use async_trait::async_trait;
use rref_core::message::Message;
use rref_core::types::{WorkerId, WorkerIndex};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// A worker endpoint speaking tarpc over TCP.
pub struct TcpAgent {
    worker_id: WorkerId,
    local_addr: SocketAddr,
    directory: RwLock<WorkerDirectory>,
    pool: WorkerClientPool,
    barrier: Arc<SyncBarrier>,
    in_flight: Arc<InFlight>,
    next_message_id: AtomicI64,
    sync_round: AtomicU64,
    runtime: Handle,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl TcpAgent {
    /// Start the worker called `name`.
    ///
    /// Binds the server to the worker's address in `directory` and registers
    /// every other entry as a peer. The agent can send and receive as soon as
    /// this returns.
    ///
    /// # Errors
    ///
    /// Fails if `name` is not in the directory or the address cannot be
    /// bound.
    pub async fn start(
        name: &str,
        directory: WorkerDirectory,
        handler: Arc<dyn RequestHandler>,
        config: &DistributedConfig,
    ) -> DistributedResult<Arc<Self>> {
        let (worker_id, addr) = directory
            .by_name(name)
            .cloned()
            .ok_or_else(|| DistributedError::UnknownWorker(name.to_string()))?;

        let barrier = Arc::new(SyncBarrier::with_timeout(directory.len(), config.sync_timeout()));
        let server = WorkerServer::new(worker_id.clone(), handler, barrier.clone());
        let (local_addr, task) = server.listen(addr).await?;

        let pool = WorkerClientPool::with_config(ClientConfig::from(config));
        for (peer, peer_addr) in directory.iter() {
            let peer_addr = if peer.id() == worker_id.id() {
                local_addr
            } else {
                *peer_addr
            };
            pool.register_worker(peer.id(), peer_addr).await;
        }

        info!(
            "Worker {} started on {} with {} peers",
            worker_id,
            local_addr,
            directory.len().saturating_sub(1)
        );

        Ok(Arc::new(Self {
            worker_id,
            local_addr,
            directory: RwLock::new(directory),
            pool,
            barrier,
            in_flight: Arc::new(InFlight::default()),
            next_message_id: AtomicI64::new(0),
            sync_round: AtomicU64::new(0),
            runtime: Handle::current(),
            server: Mutex::new(Some(task)),
        }))
    }

    /// The address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Add a worker that was not in the directory at start.
    ///
    /// The new worker also counts towards `sync`.
    pub async fn register_peer(&self, worker: WorkerId, addr: SocketAddr) -> DistributedResult<()> {
        let participants = {
            let mut directory = self.directory.write().unwrap_or_else(PoisonError::into_inner);
            directory.insert(worker.clone(), addr)?;
            directory.len()
        };
        self.pool.register_worker(worker.id(), addr).await;
        self.barrier.set_participants(participants);
        debug!("{} registered peer {} at {}", self.worker_id, worker, addr);
        Ok(())
    }

    /// Number of sends that have not completed yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.count()
    }

    fn peer_indices(&self) -> Vec<WorkerIndex> {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .workers()
            .map(WorkerId::id)
            .filter(|id| *id != self.worker_id.id())
            .collect()
    }
}

#[async_trait]
impl RpcAgent for TcpAgent {
    fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    fn send(&self, to: &WorkerId, mut message: Message) -> FutureMessage {
        message.set_id(self.next_message_id.fetch_add(1, Ordering::Relaxed));

        let known = self
            .directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_index(to.id())
            .is_some();
        if !known {
            warn!("{} cannot reach unknown worker {}", self.worker_id, to);
            return FutureMessage::ready(Err(RpcError::UnknownWorker(to.to_string())));
        }

        let (slot, future) = FutureMessage::tracked(&self.in_flight);
        let pool = self.pool.clone();
        let from = self.worker_id.clone();
        let target = to.id();
        self.runtime.spawn(async move {
            slot.complete(deliver(&pool, from, target, message).await);
        });
        future
    }

    fn get_worker_id(&self, name: &str) -> RpcResult<WorkerId> {
        self.directory
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_name(name)
            .map(|(worker, _)| worker.clone())
            .ok_or_else(|| RpcError::UnknownWorker(name.to_string()))
    }

    async fn join(&self) -> RpcResult<()> {
        self.in_flight.drained().await;

        let server = self
            .server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(server) = server {
            server.abort();
            self.pool.clear_cache().await;
            info!("Worker {} stopped", self.worker_id);
        }
        Ok(())
    }

    async fn sync(&self) -> RpcResult<()> {
        self.in_flight.drained().await;
        let round = self.sync_round.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{} reached sync round {}", self.worker_id, round);

        self.barrier.arrive(self.worker_id.id(), round);
        let arrivals = self.peer_indices().into_iter().map(|peer| async move {
            let client = self
                .pool
                .get_client(peer)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?;
            client
                .sync_arrive(self.pool.config().context(), self.worker_id.clone(), round)
                .await
                .map_err(|e| RpcError::Transport(e.to_string()))?
        });
        futures::future::try_join_all(arrivals).await?;

        self.barrier.wait_all(round).await
    }
}

async fn deliver(
    pool: &WorkerClientPool,
    from: WorkerId,
    to: WorkerIndex,
    message: Message,
) -> RpcResult<Message> {
    let request = message.is_request();
    let client = pool
        .get_client(to)
        .await
        .map_err(|e| RpcError::Transport(e.to_string()))?;

    match client.deliver(pool.config().context(), from, message).await {
        Ok(Ok(Some(reply))) => Ok(reply),
        Ok(Ok(None)) if !request => Ok(Message::ack()),
        Ok(Ok(None)) => Err(RpcError::NoReply),
        Ok(Err(e)) => Err(e),
        Err(e) => {
            pool.invalidate_client(to).await;
            Err(RpcError::Transport(e.to_string()))
        }
    }
}
