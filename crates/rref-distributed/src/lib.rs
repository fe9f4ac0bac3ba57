//! # RRef Distributed
//!
//! Owner-side bookkeeping for distributed remote references, the transport
//! contract it runs on, and two transports implementing it.
//!
//! A worker owns values and hands out references to them. The
//! [`RRefContext`] tracks, per owned value, which forks are alive on other
//! workers; the [`RRefRequestHandler`] applies the creation, fork and fetch
//! messages those workers send. Messages travel through an [`RpcAgent`]:
//! [`LocalAgent`] for workers in one process, [`rpc::TcpAgent`] across
//! processes.

pub mod agent;
pub mod context;
pub mod handler;
pub mod rpc;
pub mod session;
pub mod types;
pub mod worker;

pub use agent::{
    FutureMessage, LocalAgent, LocalNetwork, RequestHandler, ResponseSlot, RpcAgent, RpcError,
    RpcResult, SyncBarrier,
};
pub use context::{ForkTable, RRefContext};
pub use handler::RRefRequestHandler;
pub use rpc::TcpAgent;
pub use session::RpcSession;
pub use types::*;
pub use worker::Worker;
