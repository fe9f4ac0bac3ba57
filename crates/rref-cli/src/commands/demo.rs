//! In-process demonstration of the fork lifecycle.

use anyhow::{bail, Result};
use colored::Colorize;
use rref_core::message::RRefForkData;
use rref_core::rref::UserRRef;
use rref_core::types::WorkerId;
use rref_distributed::agent::LocalNetwork;
use rref_distributed::types::EvictionPolicy;
use rref_distributed::worker::Worker;

/// Run `count` workers in one process. Worker 0 owns every RRef; each other
/// worker creates one, forks it to its neighbour, and both release their
/// handles at the end.
pub fn run(count: i16) -> Result<()> {
    // The owner plus two users, so that each fork lands on another user.
    if count < 3 {
        bail!("The demo needs at least 3 workers, got {}", count);
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let network = LocalNetwork::new();
        let workers = (0..count)
            .map(|i| Worker::<String>::local(WorkerId::new(format!("w{}", i), i), &network, EvictionPolicy::Retain))
            .collect::<Result<Vec<_>, _>>()?;
        let owner = &workers[0];
        println!(
            "{} {} workers on a local network, {} owns every RRef",
            "demo".green().bold(),
            count,
            owner.worker_id()
        );

        // Each user creates an RRef and forks it to the next user.
        let mut handles: Vec<(usize, UserRRef)> = Vec::new();
        for i in 1..workers.len() {
            let creator = workers[i].context();
            let user = match creator.create_rref(owner.worker_id()).into_user() {
                Some(user) => user,
                None => bail!("{} unexpectedly owns a new RRef", creator.worker_id()),
            };
            let value = format!("value from {}", creator.worker_id().name());
            creator.notify_owner_create(&user, Some(&value))?.await?;

            let (fork, registered) = creator.fork_user(&user)?;
            registered.await?;

            let next = i % (workers.len() - 1) + 1;
            let RRefForkData { owner: fork_owner, rref_id, fork_id } = fork;
            let forwarded = workers[next]
                .context()
                .create_user_rref(&fork_owner, rref_id, fork_id)?;
            let fetched = workers[next].context().fetch_value(&forwarded).await?;
            println!(
                "  {} {} created {}, forked to {} which fetched {:?}",
                "→".blue(),
                creator.worker_id(),
                user.id(),
                workers[next].worker_id(),
                fetched
            );

            handles.push((i, user));
            handles.push((next, forwarded));
        }

        print_accounting(owner, &handles);

        for (holder, user) in handles.iter().cloned() {
            workers[holder].context().release_user(user).await?.await?;
        }
        println!("{} All handles released", "✓".green());
        print_accounting(owner, &handles);

        let evicted = owner.context().evict_unreferenced();
        println!("  {} owners evicted by sweep", evicted.to_string().cyan());

        let syncs = workers.iter().map(|w| w.sync());
        for result in futures::future::join_all(syncs).await {
            result?;
        }
        for worker in &workers {
            worker.shutdown().await?;
        }
        println!("{} Demo complete", "✓".green().bold());
        Ok(())
    })
}

fn print_accounting(owner: &Worker<String>, handles: &[(usize, UserRRef)]) {
    let context = owner.context();
    println!("{}", "Owner accounting".green().bold());
    println!("  Owners registered: {}", context.owner_count());

    let mut seen = Vec::new();
    for (_, user) in handles {
        if seen.contains(&user.id()) {
            continue;
        }
        seen.push(user.id());
        let value = context
            .owner_rref(user.id())
            .and_then(|entry| entry.value().cloned())
            .unwrap_or_else(|| "<pending>".to_string());
        println!(
            "    {} -- {:?}, {} live forks",
            format!("{}", user.id()).cyan(),
            value,
            context.fork_count(user.id())
        );
    }
}
