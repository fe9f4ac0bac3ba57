//! Run one worker of the cluster.

use anyhow::{Context, Result};
use colored::Colorize;
use rref_distributed::worker::Worker;
use std::path::Path;
use tracing::info;

use crate::config::Config;

/// Start the worker called `name` and serve until Ctrl-C.
///
/// On Ctrl-C the worker waits for every other worker to stop as well, then
/// shuts down.
pub fn run(name: &str, config_path: Option<&str>) -> Result<()> {
    let config = Config::load(config_path.map(Path::new))?;
    let directory = config.directory()?;

    println!(
        "{} Starting worker {} ({} workers in cluster)...",
        "worker".green().bold(),
        name,
        directory.len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let worker: Worker<serde_json::Value> = Worker::tcp(name, directory, &config.rpc)
            .await
            .with_context(|| format!("Failed to start worker {}", name))?;
        println!(
            "{} Worker {} serving (eviction: {:?})",
            "ready".green().bold(),
            worker.worker_id(),
            config.rpc.eviction
        );

        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        info!("Ctrl-C received, waiting for the other workers");
        println!("{} Waiting for the other workers...", "stop".yellow().bold());

        worker.sync().await.context("Final sync failed")?;
        let context = worker.context();
        println!(
            "  {} owners registered at shutdown",
            context.owner_count().to_string().cyan()
        );
        worker.shutdown().await?;

        println!("{} Worker {} stopped", "done".green().bold(), name);
        Ok(())
    })
}
