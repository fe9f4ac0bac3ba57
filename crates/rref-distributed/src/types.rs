//! Core types for distributed RRef coordination.
//!
//! This module defines the error type shared by the registry, handler and
//! transports, the serializable configuration of a worker, and the static
//! worker directory used to resolve peers.

use crate::agent::RpcError;
use rref_core::error::RRefError;
use rref_core::message::MessageType;
use rref_core::types::{WorkerId, WorkerIndex};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur in distributed operations.
#[derive(Error, Debug, Clone)]
pub enum DistributedError {
    #[error(transparent)]
    RRef(#[from] RRefError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("RRef context already has a different agent")]
    AgentAlreadySet,

    #[error("Agent belongs to worker {actual}, context to worker {expected}")]
    AgentMismatch {
        expected: WorkerIndex,
        actual: WorkerIndex,
    },

    #[error("RRef context has no agent")]
    AgentNotSet,

    #[error("No Tokio runtime to deliver the message on")]
    NoRuntime,

    #[error("Unknown worker: {0}")]
    UnknownWorker(String),

    #[error("Duplicate worker in directory: {0}")]
    DuplicateWorker(String),

    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Remote exception: {0}")]
    RemoteException(String),

    #[error("Unexpected reply {0:?}")]
    UnexpectedReply(MessageType),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("RPC has not been initialized. Call init first.")]
    NotInitialized,

    #[error("RPC is already initialized")]
    AlreadyInitialized,
}

impl From<serde_json::Error> for DistributedError {
    fn from(e: serde_json::Error) -> Self {
        DistributedError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for DistributedError {
    fn from(e: std::io::Error) -> Self {
        DistributedError::Io(e.to_string())
    }
}

/// Result type for distributed operations.
pub type DistributedResult<T> = Result<T, DistributedError>;

/// What happens to an owner entry once nothing references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionPolicy {
    /// Owner entries stay registered until swept explicitly.
    #[default]
    Retain,
    /// An owner entry is dropped as soon as its fork set is empty and no
    /// handle outside the registry holds it.
    WhenUnreferenced,
}

/// Configuration of one worker's RPC layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DistributedConfig {
    /// Eviction policy of the RRef registry.
    #[serde(default)]
    pub eviction: EvictionPolicy,
    /// Timeout for a `sync` barrier round in milliseconds.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,
    /// Timeout for connecting to a peer in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Number of connection attempts per peer.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Delay between connection attempts in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Maximum in-flight requests per peer connection.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight_requests: usize,
    /// Deadline of one delivered message in milliseconds, including the time
    /// the owner spends waiting for a value.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_sync_timeout_ms() -> u64 {
    60_000
}
fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    500
}
fn default_max_in_flight() -> usize {
    100
}
fn default_request_timeout_ms() -> u64 {
    600_000
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            eviction: EvictionPolicy::default(),
            sync_timeout_ms: default_sync_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            retry_attempts: default_retry_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            max_in_flight_requests: default_max_in_flight(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl DistributedConfig {
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// A worker entry as written in a cluster file.
///
/// The id is kept wide here so that out-of-range values are reported by
/// [`WorkerId::try_new`] instead of a generic parse error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAddress {
    pub name: String,
    pub id: i64,
    /// Socket address, e.g. `"127.0.0.1:29500"`.
    pub address: String,
}

impl WorkerAddress {
    pub fn new(name: impl Into<String>, id: i64, address: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            id,
            address: address.into(),
        }
    }

    pub fn worker_id(&self) -> DistributedResult<WorkerId> {
        Ok(WorkerId::try_new(self.name.clone(), self.id)?)
    }

    pub fn socket_addr(&self) -> DistributedResult<SocketAddr> {
        self.address
            .parse()
            .map_err(|_| DistributedError::InvalidAddress(self.address.clone()))
    }
}

/// Static mapping from worker identity to network address.
#[derive(Debug, Clone, Default)]
pub struct WorkerDirectory {
    entries: Vec<(WorkerId, SocketAddr)>,
}

impl WorkerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a directory from cluster-file entries.
    ///
    /// # Errors
    ///
    /// Fails on out-of-range ids, unparsable addresses, and names or ids that
    /// appear twice.
    pub fn from_addresses(addresses: &[WorkerAddress]) -> DistributedResult<Self> {
        let mut directory = Self::new();
        for entry in addresses {
            directory.insert(entry.worker_id()?, entry.socket_addr()?)?;
        }
        Ok(directory)
    }

    /// Add a worker.
    pub fn insert(&mut self, worker: WorkerId, addr: SocketAddr) -> DistributedResult<()> {
        if self
            .entries
            .iter()
            .any(|(w, _)| w.name() == worker.name() || w.id() == worker.id())
        {
            return Err(DistributedError::DuplicateWorker(worker.to_string()));
        }
        self.entries.push((worker, addr));
        Ok(())
    }

    pub fn by_name(&self, name: &str) -> Option<&(WorkerId, SocketAddr)> {
        self.entries.iter().find(|(w, _)| w.name() == name)
    }

    pub fn by_index(&self, id: WorkerIndex) -> Option<&(WorkerId, SocketAddr)> {
        self.entries.iter().find(|(w, _)| w.id() == id)
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerId> {
        self.entries.iter().map(|(w, _)| w)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(WorkerId, SocketAddr)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
