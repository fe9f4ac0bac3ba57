//! RPC transport using tarpc.
//!
//! # Architecture
//!
//! - **Protocol**: the `WorkerService` trait every worker serves
//! - **Server**: `WorkerServer`, wrapping a worker's request handler and
//!   sync barrier
//! - **Client**: connection functions and `WorkerClientPool`
//! - **Agent**: `TcpAgent`, the `RpcAgent` built from the three
//!
//! # Example: Starting a Worker
//!
//! ```rust,ignore
//! use rref_distributed::rpc::TcpAgent;
//!
//! let directory = WorkerDirectory::from_addresses(&config.cluster.workers)?;
//! let agent = TcpAgent::start("trainer0", directory, handler, &config.rpc).await?;
//! let ps = agent.get_worker_id("ps0")?;
//! let reply = agent.send(&ps, message).await?;
//! ```

pub mod agent;
pub mod client;
pub mod protocol;
pub mod server;

pub use agent::TcpAgent;
pub use client::{
    connect_to_worker_with_config, connect_to_worker_with_retry, ClientConfig,
    WorkerClientPool,
};
pub use protocol::{WorkerService, WorkerServiceClient};
pub use server::WorkerServer;
