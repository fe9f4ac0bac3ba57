//! Ping every configured worker.

use anyhow::Result;
use colored::Colorize;
use rref_distributed::rpc::client::{connect_to_worker_with_config, ClientConfig};
use std::path::Path;
use std::time::Duration;

use crate::config::Config;

pub fn run(config_path: Option<&str>) -> Result<()> {
    let config = Config::load(config_path.map(Path::new))?;
    let directory = config.directory()?;
    let client_config = ClientConfig {
        connect_timeout: Duration::from_millis(config.rpc.connect_timeout_ms.min(2_000)),
        ..ClientConfig::from(&config.rpc)
    };

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        println!("{}", "Cluster Status".green().bold());
        println!("  Workers: {}", directory.len());

        let mut reachable = 0;
        for (worker, addr) in directory.iter() {
            let label = format!("{}", worker).cyan();
            match connect_to_worker_with_config(*addr, &client_config).await {
                Ok(client) => match client.ping(tarpc::context::current()).await {
                    Ok(answered) if answered == *worker => {
                        reachable += 1;
                        println!("    {} -- {} {}", label, addr, "up".green());
                    }
                    Ok(answered) => {
                        println!(
                            "    {} -- {} {} (answered as {})",
                            label,
                            addr,
                            "mismatch".yellow(),
                            answered
                        );
                    }
                    Err(e) => println!("    {} -- {} {} ({})", label, addr, "down".red(), e),
                },
                Err(e) => println!("    {} -- {} {} ({})", label, addr, "down".red(), e),
            }
        }

        println!();
        println!("  {}/{} workers reachable", reachable, directory.len());
        Ok(())
    })
}
