//! End-to-end tests for RRef ownership tracking.
//!
//! Covers the registry properties on their own, then the full protocol
//! (create, fork, fetch, release, sync) between workers on an in-process
//! network and over TCP.

use rref_core::prelude::*;
use rref_distributed::agent::{LocalNetwork, RpcAgent};
use rref_distributed::context::RRefContext;
use rref_distributed::handler::RRefRequestHandler;
use rref_distributed::rpc::TcpAgent;
use rref_distributed::types::*;
use rref_distributed::{RpcSession, Worker};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn w0() -> WorkerId {
    WorkerId::new("w0", 0)
}

fn w1() -> WorkerId {
    WorkerId::new("w1", 1)
}

/// Helper: start `n` workers named w0..wn on one network.
fn local_cluster(n: i16, policy: EvictionPolicy) -> (LocalNetwork, Vec<Worker<String>>) {
    let network = LocalNetwork::new();
    let workers = (0..n)
        .map(|i| Worker::local(WorkerId::new(format!("w{}", i), i), &network, policy).unwrap())
        .collect();
    (network, workers)
}

fn permutations(items: &[usize]) -> Vec<Vec<usize>> {
    if items.len() <= 1 {
        return vec![items.to_vec()];
    }
    let mut out = Vec::new();
    for (i, first) in items.iter().enumerate() {
        let mut rest = items.to_vec();
        rest.remove(i);
        for mut tail in permutations(&rest) {
            tail.insert(0, *first);
            out.push(tail);
        }
    }
    out
}

/// Helper: apply every ordering of `ops` to a fresh context and return the
/// resulting fork sets.
fn apply_all_orders(ops: &[(bool, RRefForkData)]) -> Vec<HashSet<ForkId>> {
    let indices: Vec<usize> = (0..ops.len()).collect();
    permutations(&indices)
        .into_iter()
        .map(|order| {
            let ctx: RRefContext<u8> = RRefContext::new(w0());
            for i in order {
                let (add, data) = &ops[i];
                if *add {
                    ctx.add_fork_data(data).unwrap();
                } else {
                    ctx.del_fork_data(data).unwrap();
                }
            }
            ctx.forks_of(ops[0].1.rref_id)
        })
        .collect()
}

#[test]
fn test_owner_persists_after_last_fork() {
    let owner_ctx: RRefContext<u8> = RRefContext::new(w0());
    let user_ctx: RRefContext<u8> = RRefContext::new(w1());
    let rref_id = RRefId::new(0, 7);

    let user = user_ctx.get_or_create_rref(&w0(), rref_id, ForkId::new(1, 3));
    assert!(!user.is_owner());
    assert_eq!(user_ctx.owner_count(), 0);

    let fork = user.as_user().unwrap().fork_data();
    let owner = owner_ctx.get_or_create_rref(&fork.owner, fork.rref_id, fork.fork_id);
    assert!(owner.is_owner());
    owner_ctx.add_fork_data(&fork).unwrap();
    assert_eq!(owner_ctx.forks_of(rref_id), HashSet::from([ForkId::new(1, 3)]));

    owner_ctx.del_fork(&fork.to_payload().unwrap()).unwrap();
    assert!(owner_ctx.forks_of(rref_id).is_empty());
    assert!(owner_ctx.owner_rref(rref_id).is_some());
}

#[test]
fn test_fork_set_is_order_independent() {
    let a = RRefForkData::new(w0(), RRefId::new(0, 1), ForkId::new(1, 1));
    let b = RRefForkData::new(w0(), RRefId::new(0, 1), ForkId::new(2, 1));

    // add(A), add(A), del(A), del(A) in any order leaves A absent.
    let ops = [
        (true, a.clone()),
        (true, a.clone()),
        (false, a.clone()),
        (false, a.clone()),
        (true, b.clone()),
    ];
    for forks in apply_all_orders(&ops) {
        assert_eq!(forks, HashSet::from([b.fork_id]));
    }
}

#[test]
fn test_fork_set_is_order_independent_with_eviction() {
    let a = RRefForkData::new(w0(), RRefId::new(0, 1), ForkId::new(1, 1));
    // add(A), duplicate add(A), del(A), with a sweep after every step.
    let ops = [true, true, false];

    for policy in [EvictionPolicy::Retain, EvictionPolicy::WhenUnreferenced] {
        for order in permutations(&[0, 1, 2]) {
            let ctx: RRefContext<u8> = RRefContext::with_policy(w0(), policy);
            for &i in &order {
                if ops[i] {
                    ctx.add_fork_data(&a).unwrap();
                } else {
                    ctx.del_fork_data(&a).unwrap();
                }
                ctx.evict_unreferenced();
            }
            assert!(
                ctx.forks_of(a.rref_id).is_empty(),
                "{:?} {:?} revived the released fork",
                policy,
                order
            );
            assert_eq!(ctx.owner_count(), 0);
        }
    }
}

#[test]
fn test_concurrent_get_or_create_owner() {
    let ctx: Arc<RRefContext<u8>> = Arc::new(RRefContext::new(w0()));
    let rref_id = RRefId::new(3, 99);

    let owners: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..16)
            .map(|_| s.spawn(|| ctx.get_or_create_owner_rref(rref_id)))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(owners.iter().all(|o| Arc::ptr_eq(o, &owners[0])));
    assert_eq!(ctx.owner_count(), 1);
}

#[test]
fn test_concurrent_gen_rref_id() {
    let ctx: Arc<RRefContext<u8>> = Arc::new(RRefContext::new(w0()));

    let ids: Vec<RRefId> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| s.spawn(|| (0..1000).map(|_| ctx.gen_rref_id()).collect::<Vec<_>>()))
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let distinct: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(distinct.len(), 8000);
}

#[test]
fn test_concurrent_fork_traffic() {
    let ctx: Arc<RRefContext<u8>> = Arc::new(RRefContext::new(w0()));
    let rref_id = RRefId::new(0, 5);

    std::thread::scope(|s| {
        for worker in 1..=4i16 {
            let ctx = &ctx;
            s.spawn(move || {
                for n in 0..100u64 {
                    let data = RRefForkData::new(w0(), rref_id, ForkId::new(worker, n));
                    ctx.add_fork_data(&data).unwrap();
                    if n % 2 == 0 {
                        ctx.del_fork_data(&data).unwrap();
                    }
                }
            });
        }
    });

    assert_eq!(ctx.fork_count(rref_id), 200);
    assert_eq!(ctx.owner_count(), 1);
}

#[test]
fn test_create_user_rref_for_self_fails() {
    let ctx: RRefContext<u8> = RRefContext::new(w1());
    let result = ctx.create_user_rref(&w1(), RRefId::new(1, 1), ForkId::new(1, 2));
    assert!(matches!(
        result,
        Err(DistributedError::RRef(RRefError::OwnerCreatesUser(1)))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_local_rref_lifecycle() {
    let (_network, workers) = local_cluster(3, EvictionPolicy::Retain);
    let (owner, creator, third) = (&workers[0], &workers[1], &workers[2]);

    // The creator makes an RRef owned by w0 and hands it the value.
    let user = creator.context().create_rref(owner.worker_id()).into_user().unwrap();
    let ack = creator
        .context()
        .notify_owner_create(&user, Some(&"hello".to_string()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(ack.message_type(), MessageType::Ack);

    let entry = owner.context().owner_rref(user.id()).unwrap();
    assert_eq!(entry.value().map(String::as_str), Some("hello"));
    assert_eq!(owner.context().fork_count(user.id()), 1);

    // The creator forks its handle for the third worker.
    let (fork, registered) = creator.context().fork_user(&user).unwrap();
    tokio_test::assert_ok!(registered.await);
    assert_eq!(owner.context().fork_count(user.id()), 2);

    let forwarded = third
        .context()
        .create_user_rref(&fork.owner, fork.rref_id, fork.fork_id)
        .unwrap();
    let value = third.context().fetch_value(&forwarded).await.unwrap();
    assert_eq!(value, "hello");

    // Releasing both forks empties the set; the owner entry stays.
    tokio_test::assert_ok!(creator.context().release_user(user.clone()).await.unwrap().await);
    tokio_test::assert_ok!(third.context().release_user(forwarded).await.unwrap().await);
    assert!(owner.context().forks_of(user.id()).is_empty());
    assert!(owner.context().owner_rref(user.id()).is_some());

    let syncs = workers.iter().map(|w| w.sync());
    for result in futures::future::join_all(syncs).await {
        result.unwrap();
    }
    for worker in &workers {
        worker.shutdown().await.unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fetch_before_create() {
    let (_network, workers) = local_cluster(2, EvictionPolicy::Retain);
    let (owner, creator) = (&workers[0], &workers[1]);
    let user = creator.context().create_rref(owner.worker_id()).into_user().unwrap();

    let fetch = {
        let context = creator.context().clone();
        let user = user.clone();
        tokio::spawn(async move { context.fetch_value(&user).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert!(!fetch.is_finished());
    assert!(owner.context().owner_rref(user.id()).is_some());

    creator
        .context()
        .notify_owner_create(&user, Some(&"late".to_string()))
        .unwrap()
        .await
        .unwrap();

    let value = tokio::time::timeout(Duration::from_secs(5), fetch)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(value, "late");
}

#[tokio::test]
async fn test_release_evicts_when_unreferenced() {
    let (_network, workers) = local_cluster(2, EvictionPolicy::WhenUnreferenced);
    let (owner, creator) = (&workers[0], &workers[1]);

    let user = creator.context().create_rref(owner.worker_id()).into_user().unwrap();
    creator
        .context()
        .notify_owner_create(&user, Some(&"v".to_string()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(owner.context().owner_count(), 1);

    creator.context().release_user(user).await.unwrap().await.unwrap();
    assert_eq!(owner.context().owner_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_release_right_after_fork_keeps_value() {
    let (_network, workers) = local_cluster(3, EvictionPolicy::WhenUnreferenced);
    let (owner, creator, third) = (&workers[0], &workers[1], &workers[2]);

    let user = creator.context().create_rref(owner.worker_id()).into_user().unwrap();
    creator
        .context()
        .notify_owner_create(&user, Some(&"v".to_string()))
        .unwrap()
        .await
        .unwrap();

    // Fork for the third worker and release the parent handle without
    // waiting for the fork's registration first.
    let (fork, registered) = creator.context().fork_user(&user).unwrap();
    let rref_id = user.id();
    tokio_test::assert_ok!(creator.context().release_user(user).await.unwrap().await);

    assert_eq!(owner.context().owner_count(), 1);
    assert_eq!(owner.context().forks_of(rref_id), HashSet::from([fork.fork_id]));

    let forwarded = third
        .context()
        .create_user_rref(&fork.owner, fork.rref_id, fork.fork_id)
        .unwrap();
    let value = tokio::time::timeout(Duration::from_secs(5), third.context().fetch_value(&forwarded))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(value, "v");
    tokio_test::assert_ok!(registered.await);

    third.context().release_user(forwarded).await.unwrap().await.unwrap();
    assert_eq!(owner.context().owner_count(), 0);
}

#[tokio::test]
async fn test_late_fork_after_sweep_leaves_no_entry() {
    let (_network, workers) = local_cluster(2, EvictionPolicy::Retain);
    let (owner, creator) = (&workers[0], &workers[1]);

    let user = creator.context().create_rref(owner.worker_id()).into_user().unwrap();
    creator
        .context()
        .notify_owner_create(&user, Some(&"v".to_string()))
        .unwrap()
        .await
        .unwrap();
    creator.context().release_user(user.clone()).await.unwrap().await.unwrap();
    assert_eq!(owner.context().evict_unreferenced(), 1);

    // A duplicated add of the released fork arrives after the sweep.
    let message = Message::new(MessageType::RRefAddFork, user.fork_data().to_payload().unwrap());
    let reply = creator.agent().send(owner.worker_id(), message).await.unwrap();
    assert_eq!(reply.message_type(), MessageType::Ack);
    assert_eq!(owner.context().owner_count(), 0);

    let fetched = creator.context().fetch_value(&user).await;
    assert!(matches!(fetched, Err(DistributedError::RemoteException(_))));
    assert_eq!(owner.context().owner_count(), 0);
}

#[tokio::test]
async fn test_fork_sent_to_wrong_worker() {
    let (_network, workers) = local_cluster(2, EvictionPolicy::Retain);

    // A fork of an RRef owned by w1, wrongly sent to w0.
    let stray = RRefForkData::new(w1(), RRefId::new(1, 4), ForkId::new(1, 5));
    let message = Message::new(MessageType::RRefAddFork, stray.to_payload().unwrap());
    let reply = workers[1].agent().send(&w0(), message).await.unwrap();

    let text = reply.exception_text().unwrap();
    assert!(text.contains("owned by worker 1"), "{}", text);
    assert_eq!(workers[0].context().owner_count(), 0);
}

#[tokio::test]
async fn test_session_over_local_worker() {
    let session = RpcSession::new();
    let (network, workers) = local_cluster(2, EvictionPolicy::Retain);
    session.init(workers[0].agent().clone()).unwrap();

    assert_eq!(session.worker_id(None).unwrap(), w0());
    assert_eq!(session.worker_id(Some("w1")).unwrap(), w1());

    let fork = RRefForkData::new(w1(), RRefId::new(0, 1), ForkId::new(0, 2));
    let message = Message::new(MessageType::RRefAddFork, fork.to_payload().unwrap());
    let reply = session.send("w1", message).unwrap().await.unwrap();
    assert_eq!(reply.message_type(), MessageType::Ack);
    assert_eq!(workers[1].context().fork_count(RRefId::new(0, 1)), 1);

    // w1 leaves first so that the session's sync only waits for w0.
    workers[1].shutdown().await.unwrap();
    session.join().await.unwrap();
    assert!(!session.is_initialized());
    assert_eq!(network.worker_count(), 0);
}

/// Helper: start a TCP worker on an ephemeral port, knowing only itself.
async fn tcp_worker(name: &str, id: i64) -> (Arc<RRefContext<String>>, Arc<TcpAgent>) {
    let directory =
        WorkerDirectory::from_addresses(&[WorkerAddress::new(name, id, "127.0.0.1:0")]).unwrap();
    let worker_id = directory.by_name(name).unwrap().0.clone();

    let context = Arc::new(RRefContext::new(worker_id));
    let handler = RRefRequestHandler::new(&context);
    let config = DistributedConfig {
        sync_timeout_ms: 10_000,
        ..DistributedConfig::default()
    };
    let agent = TcpAgent::start(name, directory, handler, &config).await.unwrap();
    context.seed_agent(agent.clone()).unwrap();
    (context, agent)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_tcp_rref_lifecycle() {
    let (owner_ctx, owner_agent) = tcp_worker("w0", 0).await;
    let (user_ctx, user_agent) = tcp_worker("w1", 1).await;

    owner_agent
        .register_peer(w1(), user_agent.local_addr())
        .await
        .unwrap();
    user_agent
        .register_peer(w0(), owner_agent.local_addr())
        .await
        .unwrap();
    assert_eq!(user_agent.get_worker_id("w0").unwrap(), w0());

    let user = user_ctx.create_rref(&w0()).into_user().unwrap();
    user_ctx
        .notify_owner_create(&user, Some(&"over tcp".to_string()))
        .unwrap()
        .await
        .unwrap();
    assert_eq!(owner_ctx.fork_count(user.id()), 1);

    let value = user_ctx.fetch_value(&user).await.unwrap();
    assert_eq!(value, "over tcp");

    user_ctx.release_user(user.clone()).await.unwrap().await.unwrap();
    assert_eq!(owner_ctx.fork_count(user.id()), 0);

    let (a, b) = tokio::join!(owner_agent.sync(), user_agent.sync());
    a.unwrap();
    b.unwrap();

    user_agent.join().await.unwrap();
    owner_agent.join().await.unwrap();
}

#[tokio::test]
async fn test_tcp_unknown_worker() {
    let (_ctx, agent) = tcp_worker("solo", 4).await;
    assert!(agent.get_worker_id("nobody").is_err());

    let result = agent
        .send(&WorkerId::new("nobody", 9), Message::shutdown())
        .await;
    assert!(result.is_err());
    agent.join().await.unwrap();
}
