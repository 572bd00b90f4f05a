//! End-to-end tests: workers sharing one store, and the full node.


use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use distcron::config::ClusterConfig;
use distcron::error::CronError;
use distcron::logstore::{LogQuery, LogStore, MemoryLogStore};
use distcron::master::{JobManager, WorkerManager};
use distcron::node::Node;
use distcron::scheduler::Job;
use distcron::store::keys::lock_key;
use distcron::store::{CoordinationClient, MemoryStore};
use distcron::worker::Worker;
use test_harness::{assert_eventually, test_worker_config};

fn spawn_worker(
    id: &str,
    jitter_ms: u64,
    store: &Arc<MemoryStore>,
    logs: &Arc<MemoryLogStore>,
    shutdown: &CancellationToken,
) -> tokio::task::JoinHandle<distcron::error::Result<()>> {
    let config = test_worker_config(id).with_jitter_max_ms(jitter_ms);
    let worker = Worker::new(config, store.clone(), logs.clone());
    tokio::spawn(worker.run(shutdown.clone()))
}

#[tokio::test]
async fn test_each_tick_runs_on_exactly_one_worker() {
    let store = Arc::new(MemoryStore::new());
    let logs = Arc::new(MemoryLogStore::new());
    let shutdown = CancellationToken::new();
    let jobs = JobManager::new(store.clone(), 1);

    // Commands outlast the jitter, so the loser always finds the lock held.
    let w1 = spawn_worker("w1", 200, &store, &logs, &shutdown);
    let w2 = spawn_worker("w2", 200, &store, &logs, &shutdown);
    jobs.save_job(&Job::new("j1", "sleep 0.5; echo hi", "* * * * * *"))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    shutdown.cancel();
    assert!(w1.await.unwrap().is_ok());
    assert!(w2.await.unwrap().is_ok());

    let entries = logs.entries().await;
    assert!(entries.len() >= 2, "expected several runs, got {}", entries.len());

    let mut per_tick: HashMap<i64, usize> = HashMap::new();
    for entry in &entries {
        assert_eq!(entry.job_name, "j1");
        assert_eq!(entry.output, "hi\n");
        assert_eq!(entry.err, "");
        assert_eq!(entry.plan_time % 1000, 0);
        *per_tick.entry(entry.plan_time).or_default() += 1;
    }
    for (tick, count) in per_tick {
        assert_eq!(count, 1, "tick {} ran {} times", tick, count);
    }
}

#[tokio::test]
async fn test_workers_show_up_in_listing() {
    let store = Arc::new(MemoryStore::new());
    let logs = Arc::new(MemoryLogStore::new());
    let shutdown = CancellationToken::new();
    let workers = Arc::new(WorkerManager::new(store.clone()));

    let w1 = spawn_worker("w1", 0, &store, &logs, &shutdown);
    let w2 = spawn_worker("w2", 0, &store, &logs, &shutdown);

    let manager = workers.clone();
    assert_eventually(
        || {
            let manager = manager.clone();
            async move { manager.list_workers().await.unwrap() == vec!["w1", "w2"] }
        },
        Duration::from_secs(5),
        "both workers should register",
    )
    .await;

    shutdown.cancel();
    w1.await.unwrap().unwrap();
    w2.await.unwrap().unwrap();
    assert!(workers.list_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_kill_stops_running_execution() {
    let store = Arc::new(MemoryStore::new());
    let logs = Arc::new(MemoryLogStore::new());
    let shutdown = CancellationToken::new();
    let jobs = JobManager::new(store.clone(), 1);

    let worker = spawn_worker("w1", 0, &store, &logs, &shutdown);
    jobs.save_job(&Job::new("slow", "sleep 30", "* * * * * *"))
        .await
        .unwrap();

    let s = store.clone();
    assert_eventually(
        || {
            let s = s.clone();
            async move { !s.get(&lock_key("slow")).await.unwrap().kvs.is_empty() }
        },
        Duration::from_secs(5),
        "job never started",
    )
    .await;

    jobs.kill_job("slow").await.unwrap();

    let l = logs.clone();
    assert_eventually(
        || {
            let l = l.clone();
            async move { l.entries().await.iter().any(|e| e.err == "killed") }
        },
        Duration::from_secs(5),
        "killed execution was never logged",
    )
    .await;

    let killed = logs
        .entries()
        .await
        .into_iter()
        .find(|e| e.err == "killed")
        .unwrap();
    assert_eq!(killed.job_name, "slow");
    assert_eq!(killed.output, "");

    jobs.delete_job("slow").await.unwrap();
    shutdown.cancel();
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_closed_registry_watch_stops_worker() {
    let store = Arc::new(MemoryStore::new());
    let logs = Arc::new(MemoryLogStore::new());
    let shutdown = CancellationToken::new();

    let worker = spawn_worker("w1", 0, &store, &logs, &shutdown);
    let workers = WorkerManager::new(store.clone());
    let s = store.clone();
    assert_eventually(
        || {
            let s = s.clone();
            async move { s.lease_count().await == 1 }
        },
        Duration::from_secs(5),
        "worker never registered",
    )
    .await;

    store.close_watchers().await;

    let result = tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker did not stop")
        .unwrap();
    assert!(matches!(result, Err(CronError::WatchClosed { .. })));
    // The worker withdrew its presence on the way out.
    assert!(workers.list_workers().await.unwrap().is_empty());
    assert!(!shutdown.is_cancelled());
}

#[tokio::test]
async fn test_node_runs_jobs_and_shuts_down() {
    let mut config = ClusterConfig::default();
    config.master.api_addr = "127.0.0.1:0".parse().unwrap();
    config.workers = 2;
    config.worker = test_worker_config("node");

    let node = Node::new(config);
    let store = node.store().clone();
    let logs = node.log_store().clone();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(node.run(shutdown.clone()));

    let workers = Arc::new(WorkerManager::new(store.clone()));
    let w = workers.clone();
    assert_eventually(
        || {
            let w = w.clone();
            async move { w.list_workers().await.unwrap() == vec!["node-1", "node-2"] }
        },
        Duration::from_secs(5),
        "node workers should register",
    )
    .await;

    JobManager::new(store.clone(), 1)
        .save_job(&Job::new("hello", "echo from node", "* * * * * *"))
        .await
        .unwrap();

    let l = logs.clone();
    assert_eventually(
        || {
            let l = l.clone();
            async move {
                let page = l.query(&LogQuery::new("hello", 0, 10)).await.unwrap();
                page.iter().any(|e| e.output == "from node\n")
            }
        },
        Duration::from_secs(5),
        "node never logged an execution",
    )
    .await;

    shutdown.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("node did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert!(workers.list_workers().await.unwrap().is_empty());
}
