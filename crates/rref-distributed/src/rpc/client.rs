//! tarpc client utilities.
//!
//! Connection functions with timeout and retry, and a pool that keeps one
//! client per peer worker.

use crate::rpc::protocol::WorkerServiceClient;
use crate::types::DistributedConfig;
use rref_core::types::WorkerIndex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tarpc::client::Config;
use tarpc::context::{self, Context};
use tokio::sync::RwLock;
use tokio_serde::formats::Bincode;
use tracing::{debug, error, info, warn};

/// Configuration for client connections.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Number of connection attempts.
    pub retry_attempts: u32,
    /// Delay between attempts.
    pub retry_delay: Duration,
    /// Maximum pending requests per client.
    pub max_pending_requests: usize,
    /// Deadline attached to every request.
    pub request_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&DistributedConfig::default())
    }
}

impl From<&DistributedConfig> for ClientConfig {
    fn from(config: &DistributedConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            retry_attempts: config.retry_attempts.max(1),
            retry_delay: Duration::from_millis(config.retry_delay_ms),
            max_pending_requests: config.max_in_flight_requests,
            request_timeout: config.request_timeout(),
        }
    }
}

impl ClientConfig {
    /// A request context whose deadline is `request_timeout` from now.
    pub fn context(&self) -> Context {
        let mut ctx = context::current();
        ctx.deadline = SystemTime::now() + self.request_timeout;
        ctx
    }
}

/// Create a client connection to a worker with custom configuration.
///
/// # Errors
///
/// Returns an error if the connection cannot be established within
/// `config.connect_timeout`.
pub async fn connect_to_worker_with_config(
    addr: SocketAddr,
    config: &ClientConfig,
) -> Result<WorkerServiceClient, std::io::Error> {
    debug!("Connecting to worker at {} with custom config", addr);

    let transport = tokio::time::timeout(
        config.connect_timeout,
        tarpc::serde_transport::tcp::connect(addr, Bincode::default),
    )
    .await
    .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "connection timeout"))??;

    let mut tarpc_config = Config::default();
    tarpc_config.max_in_flight_requests = config.max_pending_requests;

    let client = WorkerServiceClient::new(tarpc_config, transport).spawn();
    info!("Connected to worker at {}", addr);
    Ok(client)
}

/// Connect to a worker, retrying on failure.
///
/// # Errors
///
/// Returns the last error if all attempts fail.
pub async fn connect_to_worker_with_retry(
    addr: SocketAddr,
    config: &ClientConfig,
) -> Result<WorkerServiceClient, std::io::Error> {
    let mut last_error = None;

    for attempt in 0..config.retry_attempts {
        if attempt > 0 {
            warn!("Retry attempt {} connecting to worker at {}", attempt + 1, addr);
            tokio::time::sleep(config.retry_delay).await;
        }

        match connect_to_worker_with_config(addr, config).await {
            Ok(client) => {
                if attempt > 0 {
                    info!(
                        "Successfully connected to worker at {} after {} attempts",
                        addr,
                        attempt + 1
                    );
                }
                return Ok(client);
            }
            Err(e) => {
                warn!("Failed to connect to worker at {}: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    error!(
        "Failed to connect to worker at {} after {} attempts",
        addr, config.retry_attempts
    );
    Err(last_error.unwrap_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::NotConnected, "connection failed")
    }))
}

/// A pool of worker client connections.
///
/// Connections are created lazily on the first `get_client` for a worker
/// and reused afterwards. Cloning shares the pool.
#[derive(Clone)]
pub struct WorkerClientPool {
    /// Mapping from worker index to address.
    addresses: Arc<RwLock<HashMap<WorkerIndex, SocketAddr>>>,
    /// Cached client connections.
    clients: Arc<RwLock<HashMap<WorkerIndex, WorkerServiceClient>>>,
    config: ClientConfig,
}

impl WorkerClientPool {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            addresses: Arc::new(RwLock::new(HashMap::new())),
            clients: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register a worker's address.
    ///
    /// Re-registering drops any cached connection to the old address.
    pub async fn register_worker(&self, worker: WorkerIndex, addr: SocketAddr) {
        let previous = self.addresses.write().await.insert(worker, addr);
        if previous.is_some_and(|old| old != addr) {
            self.clients.write().await.remove(&worker);
        }
        debug!("Registered worker {} at {}", worker, addr);
    }

    /// Get a client for `worker`, connecting if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker is not registered or if the connection
    /// fails.
    pub async fn get_client(&self, worker: WorkerIndex) -> Result<WorkerServiceClient, std::io::Error> {
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(&worker) {
                return Ok(client.clone());
            }
        }

        let addr = self.addresses.read().await.get(&worker).copied();
        let addr = addr.ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("worker {} not registered", worker),
            )
        })?;

        let client = connect_to_worker_with_retry(addr, &self.config).await?;
        self.clients.write().await.insert(worker, client.clone());
        Ok(client)
    }

    pub async fn worker_count(&self) -> usize {
        self.addresses.read().await.len()
    }

    /// Clear all cached connections.
    pub async fn clear_cache(&self) {
        self.clients.write().await.clear();
        debug!("Cleared connection cache");
    }

    /// Remove the cached connection to `worker`, forcing a reconnect on the
    /// next call.
    pub async fn invalidate_client(&self, worker: WorkerIndex) {
        self.clients.write().await.remove(&worker);
        debug!("Invalidated cached client for worker {}", worker);
    }
}

impl Default for WorkerClientPool {
    fn default() -> Self {
        Self::new()
    }
}
