//! Round-based barrier behind `RpcAgent::sync`.
//!
//! Every call to `sync` on an agent opens the agent's next round. A worker
//! records its arrival for that round (locally, and at its peers for remote
//! transports) and then waits until every participant has arrived for the
//! same round. Rounds line up because every participant calls `sync` the same
//! number of times.

use crate::agent::{RpcError, RpcResult};
use rref_core::types::WorkerIndex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Barrier ensuring all workers reach a sync round before any proceeds.
pub struct SyncBarrier {
    /// Number of workers expected to participate.
    participants: AtomicUsize,
    /// Set of (worker, round) pairs that have arrived.
    arrived: Mutex<HashSet<(WorkerIndex, u64)>>,
    /// Notification channel for waiters.
    notify: Notify,
    /// Upper bound on a single wait.
    timeout: Option<Duration>,
}

impl SyncBarrier {
    /// Create a barrier for the given number of workers, waiting forever.
    pub fn new(participants: usize) -> Self {
        Self {
            participants: AtomicUsize::new(participants),
            arrived: Mutex::new(HashSet::new()),
            notify: Notify::new(),
            timeout: None,
        }
    }

    /// Create a barrier whose waits fail after `timeout`.
    pub fn with_timeout(participants: usize, timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            ..Self::new(participants)
        }
    }

    /// Update the expected worker count.
    ///
    /// Called when workers join or leave; wakes waiters since a smaller count
    /// may complete a round.
    pub fn set_participants(&self, count: usize) {
        self.participants.store(count, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn participants(&self) -> usize {
        self.participants.load(Ordering::SeqCst)
    }

    /// Record that `worker` reached `round`.
    ///
    /// Arrivals are idempotent. Rounds older than `round - 1` are forgotten:
    /// a worker can only reach `round` once everyone has left `round - 2`.
    pub fn arrive(&self, worker: WorkerIndex, round: u64) {
        {
            let mut arrived = self.arrived.lock().unwrap_or_else(PoisonError::into_inner);
            arrived.retain(|(_, r)| r + 1 >= round);
            arrived.insert((worker, round));
        }
        self.notify.notify_waiters();
    }

    /// Get the number of workers that have arrived at a round.
    pub fn arrived_count(&self, round: u64) -> usize {
        self.arrived
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, r)| *r == round)
            .count()
    }

    /// Wait for all workers to arrive at a round.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::SyncTimeout`] if the barrier has a timeout and it
    /// elapses first.
    pub async fn wait_all(&self, round: u64) -> RpcResult<()> {
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.wait_round(round))
                .await
                .map_err(|_| RpcError::SyncTimeout(round)),
            None => {
                self.wait_round(round).await;
                Ok(())
            }
        }
    }

    async fn wait_round(&self, round: u64) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.arrived_count(round) >= self.participants() {
                return;
            }
            notified.await;
        }
    }
}
