//! A worker: one RRef context wired to one agent.
//!
//! Building a worker by hand takes four steps (context, handler, agent,
//! seeding the agent into the context) in a fixed order. [`Worker`] does
//! them once for either transport.

use crate::agent::{LocalAgent, LocalNetwork, RpcAgent};
use crate::context::RRefContext;
use crate::handler::RRefRequestHandler;
use crate::rpc::TcpAgent;
use crate::types::{DistributedConfig, DistributedError, DistributedResult, EvictionPolicy, WorkerDirectory};
use rref_core::types::WorkerId;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// A running worker holding RRefs of type `T`.
pub struct Worker<T> {
    context: Arc<RRefContext<T>>,
    agent: Arc<dyn RpcAgent>,
}

impl<T> Worker<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Start a worker on an in-process network.
    pub fn local(worker_id: WorkerId, network: &LocalNetwork, policy: EvictionPolicy) -> DistributedResult<Self> {
        let context = Arc::new(RRefContext::with_policy(worker_id.clone(), policy));
        let handler = RRefRequestHandler::new(&context);
        let agent: Arc<dyn RpcAgent> = LocalAgent::spawn(worker_id, handler, network)?;
        Self::assemble(context, agent)
    }

    /// Start the worker called `name` from `directory` over TCP.
    pub async fn tcp(name: &str, directory: WorkerDirectory, config: &DistributedConfig) -> DistributedResult<Self> {
        let worker_id = directory
            .by_name(name)
            .map(|(worker, _)| worker.clone())
            .ok_or_else(|| DistributedError::UnknownWorker(name.to_string()))?;

        let context = Arc::new(RRefContext::with_policy(worker_id, config.eviction));
        let handler = RRefRequestHandler::new(&context);
        let agent: Arc<dyn RpcAgent> = TcpAgent::start(name, directory, handler, config).await?;
        Self::assemble(context, agent)
    }

    fn assemble(context: Arc<RRefContext<T>>, agent: Arc<dyn RpcAgent>) -> DistributedResult<Self> {
        context.seed_agent(agent.clone())?;
        info!("Worker {} ready", context.worker_id());
        Ok(Self { context, agent })
    }
}

impl<T> Worker<T> {
    pub fn context(&self) -> &Arc<RRefContext<T>> {
        &self.context
    }

    pub fn agent(&self) -> &Arc<dyn RpcAgent> {
        &self.agent
    }

    pub fn worker_id(&self) -> &WorkerId {
        self.context.worker_id()
    }

    /// Wait until every worker reaches this point with its sends flushed.
    pub async fn sync(&self) -> DistributedResult<()> {
        self.agent.sync().await?;
        Ok(())
    }

    /// Stop the agent once its in-flight sends have completed.
    pub async fn shutdown(&self) -> DistributedResult<()> {
        self.agent.join().await?;
        info!("Worker {} shut down", self.worker_id());
        Ok(())
    }
}
