//! RRef CLI - run and inspect RRef workers.

mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rref")]
#[command(author, version, about = "RRef - distributed remote references", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default rref.toml
    Init {
        /// Target directory (default: current directory)
        #[arg(short, long)]
        path: Option<String>,
    },

    /// Start a worker from the cluster config and serve until Ctrl-C
    Worker {
        /// Worker name as listed in the config
        #[arg(short, long)]
        name: String,

        /// Config file (default: nearest rref.toml)
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Ping every worker in the cluster config
    Status {
        /// Config file (default: nearest rref.toml)
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Run an in-process fork lifecycle and print the owner's accounting
    Demo {
        /// Number of workers, including the owner
        #[arg(short, long, default_value = "3")]
        workers: i16,
    },
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Init { path } => commands::init::run(path),
        Commands::Worker { name, config } => commands::worker::run(&name, config.as_deref()),
        Commands::Status { config } => commands::status::run(config.as_deref()),
        Commands::Demo { workers } => commands::demo::run(workers),
    }
}
