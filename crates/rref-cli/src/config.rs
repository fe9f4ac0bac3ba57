//! Configuration management for the RRef CLI.

use anyhow::{Context, Result};
use rref_distributed::types::{DistributedConfig, WorkerAddress, WorkerDirectory};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Name of the config file searched for in the current and parent
/// directories.
pub const CONFIG_FILE: &str = "rref.toml";

/// Cluster configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub rpc: DistributedConfig,
}

/// The static worker list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_workers")]
    pub workers: Vec<WorkerAddress>,
}

fn default_workers() -> Vec<WorkerAddress> {
    vec![
        WorkerAddress::new("worker0", 0, "127.0.0.1:29500"),
        WorkerAddress::new("worker1", 1, "127.0.0.1:29501"),
    ]
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

impl Config {
    /// Load config from `path`, or from the nearest rref.toml if no path is
    /// given. Falls back to defaults when no file is found.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path.map(Path::to_path_buf).or_else(find_config_file) {
            Some(path) => Self::load_from(&path),
            None => Ok(Config::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
    }

    /// Save config to the specified path.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config: {}", path.display()))?;
        Ok(())
    }

    /// Generate default config as TOML string.
    pub fn default_toml() -> Result<String> {
        toml::to_string_pretty(&Config::default()).context("Failed to serialize config")
    }

    /// Resolve the worker list into a directory.
    pub fn directory(&self) -> Result<WorkerDirectory> {
        WorkerDirectory::from_addresses(&self.cluster.workers).context("Invalid worker list")
    }
}

/// Find rref.toml in current or parent directories.
fn find_config_file() -> Option<PathBuf> {
    let mut dir = std::env::current_dir().ok()?;
    loop {
        let config_path = dir.join(CONFIG_FILE);
        if config_path.exists() {
            return Some(config_path);
        }
        if !dir.pop() {
            break;
        }
    }
    None
}
