//! Write a default cluster config.

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;

use crate::config::{Config, CONFIG_FILE};

pub fn run(path: Option<String>) -> Result<()> {
    let base_path = match path {
        Some(p) => PathBuf::from(p),
        None => std::env::current_dir().context("Failed to read current directory")?,
    };

    println!("{} Initializing RRef cluster config...", "→".blue());

    std::fs::create_dir_all(&base_path)
        .with_context(|| format!("Failed to create {}", base_path.display()))?;

    let config_path = base_path.join(CONFIG_FILE);
    if config_path.exists() {
        println!("  {} {} already exists", "•".yellow(), config_path.display());
        return Ok(());
    }

    let config = Config::default();
    config.save(&config_path)?;
    println!("  {} Created {}", "✓".green(), config_path.display());
    for worker in &config.cluster.workers {
        println!("    {} #{} at {}", worker.name.cyan(), worker.id, worker.address);
    }

    println!();
    println!("Next steps:");
    println!("  {} rref worker --name worker0", "1.".blue());
    println!("  {} rref worker --name worker1", "2.".blue());
    println!("  {} rref status", "3.".blue());

    Ok(())
}
