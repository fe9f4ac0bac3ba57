//! tarpc server implementation.
//!
//! A [`WorkerServer`] exposes a worker's [`RequestHandler`] and sync barrier
//! to its peers. Every request runs on its own task, so one slow handler
//! (typically a fetch waiting for a value) never blocks the connection.

use crate::agent::{RequestHandler, RpcResult, SyncBarrier};
use crate::rpc::protocol::WorkerService;
use futures::StreamExt;
use rref_core::message::Message;
use rref_core::types::WorkerId;
use std::net::SocketAddr;
use std::sync::Arc;
use tarpc::context::Context;
use tarpc::server::{self, Channel};
use tokio::task::JoinHandle;
use tokio_serde::formats::Bincode;
use tracing::{debug, info, instrument};

/// Server side of one worker.
#[derive(Clone)]
pub struct WorkerServer {
    worker_id: WorkerId,
    handler: Arc<dyn RequestHandler>,
    barrier: Arc<SyncBarrier>,
}

impl WorkerServer {
    /// Create a server dispatching to `handler` and recording sync arrivals
    /// in `barrier`.
    pub fn new(worker_id: WorkerId, handler: Arc<dyn RequestHandler>, barrier: Arc<SyncBarrier>) -> Self {
        Self {
            worker_id,
            handler,
            barrier,
        }
    }

    /// Bind to `addr` and serve in the background.
    ///
    /// Returns the bound address (useful with port 0) and the accept task.
    ///
    /// # Errors
    ///
    /// Returns an error if the server fails to bind to the address.
    pub async fn listen(self, addr: SocketAddr) -> Result<(SocketAddr, JoinHandle<()>), std::io::Error> {
        let mut listener = tarpc::serde_transport::tcp::listen(&addr, Bincode::default).await?;
        listener.config_mut().max_frame_length(usize::MAX);
        let local_addr = listener.local_addr();
        info!("Worker {} listening on {}", self.worker_id, local_addr);

        let task = tokio::spawn(async move {
            listener
                .filter_map(|r| futures::future::ready(r.ok()))
                .map(server::BaseChannel::with_defaults)
                .for_each_concurrent(None, |channel| {
                    let server = self.clone();
                    async move {
                        channel
                            .execute(server.serve())
                            .for_each(|response| async move {
                                tokio::spawn(response);
                            })
                            .await
                    }
                })
                .await;
        });

        Ok((local_addr, task))
    }
}

impl WorkerService for WorkerServer {
    #[instrument(skip(self, _ctx, message), fields(kind = ?message.message_type(), id = message.id()))]
    async fn deliver(self, _ctx: Context, from: WorkerId, message: Message) -> RpcResult<Option<Message>> {
        debug!("Delivering message from {}", from);
        Ok(self.handler.handle(&from, message).await)
    }

    #[instrument(skip(self, _ctx))]
    async fn sync_arrive(self, _ctx: Context, worker: WorkerId, round: u64) -> RpcResult<()> {
        self.barrier.arrive(worker.id(), round);
        Ok(())
    }

    async fn ping(self, _ctx: Context) -> WorkerId {
        self.worker_id
    }
}
