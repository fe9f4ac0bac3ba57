//! Process-level RPC lifecycle.
//!
//! An [`RpcSession`] holds the agent of the running worker between `init`
//! and `join`. It is a plain value; a binary that wants one session per
//! process keeps it in a `static`.

use crate::agent::{FutureMessage, RpcAgent};
use crate::types::{DistributedError, DistributedResult};
use rref_core::message::Message;
use rref_core::types::WorkerId;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

/// Lifecycle wrapper around a worker's agent.
pub struct RpcSession {
    agent: RwLock<Option<Arc<dyn RpcAgent>>>,
}

impl RpcSession {
    pub const fn new() -> Self {
        Self {
            agent: RwLock::new(None),
        }
    }

    /// Start the session with `agent`.
    ///
    /// # Errors
    ///
    /// Fails with [`DistributedError::AlreadyInitialized`] while a previous
    /// session is live.
    pub fn init(&self, agent: Arc<dyn RpcAgent>) -> DistributedResult<()> {
        let mut slot = self.agent.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return Err(DistributedError::AlreadyInitialized);
        }
        info!("RPC session started for {}", agent.worker_id());
        *slot = Some(agent);
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.agent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// The live agent.
    pub fn agent(&self) -> DistributedResult<Arc<dyn RpcAgent>> {
        self.agent
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(DistributedError::NotInitialized)
    }

    /// This worker's id, or the id of the worker called `name`.
    pub fn worker_id(&self, name: Option<&str>) -> DistributedResult<WorkerId> {
        let agent = self.agent()?;
        match name {
            Some(name) => Ok(agent.get_worker_id(name)?),
            None => Ok(agent.worker_id().clone()),
        }
    }

    /// Send `message` to the worker called `to`.
    pub fn send(&self, to: &str, message: Message) -> DistributedResult<FutureMessage> {
        let agent = self.agent()?;
        let target = agent.get_worker_id(to)?;
        Ok(agent.send(&target, message))
    }

    /// Wait until every worker reaches this point.
    pub async fn sync(&self) -> DistributedResult<()> {
        let agent = self.agent()?;
        agent.sync().await?;
        Ok(())
    }

    /// Wait for every worker, then stop the agent and end the session.
    ///
    /// Does nothing if no session is live.
    pub async fn join(&self) -> DistributedResult<()> {
        let Ok(agent) = self.agent() else {
            return Ok(());
        };
        agent.sync().await?;
        agent.join().await?;

        self.agent
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        info!("RPC session ended for {}", agent.worker_id());
        Ok(())
    }
}

impl Default for RpcSession {
    fn default() -> Self {
        Self::new()
    }
}
