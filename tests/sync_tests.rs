
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use distcron::error::CronError;
use distcron::scheduler::{Job, JobEvent};
use distcron::store::keys::{job_key, killer_key};
use distcron::store::{CoordinationClient, MemoryStore};
use distcron::worker::JobWatcher;

async fn save(store: &MemoryStore, job: &Job) {
    store
        .put(&job_key(&job.name), job.to_bytes().unwrap(), None)
        .await
        .unwrap();
}

async fn recv(rx: &mut mpsc::Receiver<JobEvent>) -> JobEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for job event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_snapshot_then_watch_delivers_each_change_once() {
    let store = Arc::new(MemoryStore::new());
    let j1 = Job::new("j1", "echo 1", "* * * * * *");
    let j2 = Job::new("j2", "echo 2", "*/5 * * * * *");
    save(&store, &j1).await;
    save(&store, &j2).await;

    let (tx, mut rx) = mpsc::channel(16);
    let shutdown = CancellationToken::new();
    let watcher = JobWatcher::new(store.clone(), shutdown.clone());
    let task = watcher.watch_jobs(tx).await.unwrap();

    // Snapshot, in key order.
    assert_eq!(recv(&mut rx).await, JobEvent::Upsert(j1.clone()));
    assert_eq!(recv(&mut rx).await, JobEvent::Upsert(j2.clone()));

    let j3 = Job::new("j3", "echo 3", "0 * * * * *");
    let j2b = Job::new("j2", "echo 2b", "*/5 * * * * *");
    save(&store, &j3).await;
    store.delete(&job_key("j1")).await.unwrap();
    save(&store, &j2b).await;

    assert_eq!(recv(&mut rx).await, JobEvent::Upsert(j3));
    assert_eq!(recv(&mut rx).await, JobEvent::Delete { name: "j1".into() });
    assert_eq!(recv(&mut rx).await, JobEvent::Upsert(j2b));
    assert!(rx.try_recv().is_err());

    shutdown.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_malformed_jobs_are_skipped() {
    let store = Arc::new(MemoryStore::new());
    store
        .put(&job_key("bad"), b"{not json".to_vec(), None)
        .await
        .unwrap();
    let good = Job::new("good", "true", "* * * * * *");
    save(&store, &good).await;

    let (tx, mut rx) = mpsc::channel(16);
    let watcher = JobWatcher::new(store.clone(), CancellationToken::new());
    let _task = watcher.watch_jobs(tx).await.unwrap();
    assert_eq!(recv(&mut rx).await, JobEvent::Upsert(good));

    store
        .put(&job_key("bad2"), b"garbage".to_vec(), None)
        .await
        .unwrap();
    let later = Job::new("later", "true", "* * * * * *");
    save(&store, &later).await;
    assert_eq!(recv(&mut rx).await, JobEvent::Upsert(later));
}

#[tokio::test]
async fn test_kill_requests_and_expiry() {
    let store = Arc::new(MemoryStore::new());
    let (tx, mut rx) = mpsc::channel(16);
    let watcher = JobWatcher::new(store.clone(), CancellationToken::new());
    let _task = watcher.watch_killer(tx).await.unwrap();

    let lease = store.lease_grant(1).await.unwrap();
    store
        .put(&killer_key("j1"), Vec::new(), Some(lease.id))
        .await
        .unwrap();
    assert_eq!(recv(&mut rx).await, JobEvent::Kill { name: "j1".into() });

    // Removal of the request must not produce an event.
    store.lease_revoke(lease.id).await.unwrap();
    store.put(&killer_key("j2"), Vec::new(), None).await.unwrap();
    assert_eq!(recv(&mut rx).await, JobEvent::Kill { name: "j2".into() });
}

#[tokio::test]
async fn test_kill_watch_ignores_history() {
    let store = Arc::new(MemoryStore::new());
    store.put(&killer_key("old"), Vec::new(), None).await.unwrap();

    let (tx, mut rx) = mpsc::channel(16);
    let watcher = JobWatcher::new(store.clone(), CancellationToken::new());
    let _task = watcher.watch_killer(tx).await.unwrap();

    store.put(&killer_key("new"), Vec::new(), None).await.unwrap();
    assert_eq!(recv(&mut rx).await, JobEvent::Kill { name: "new".into() });
}

#[tokio::test]
async fn test_closed_watch_is_an_error() {
    let store = Arc::new(MemoryStore::new());
    let (tx, _rx) = mpsc::channel(16);
    let watcher = JobWatcher::new(store.clone(), CancellationToken::new());
    let jobs = watcher.watch_jobs(tx.clone()).await.unwrap();
    let killer = watcher.watch_killer(tx).await.unwrap();

    store.close_watchers().await;

    let jobs = tokio::time::timeout(Duration::from_secs(5), jobs)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(jobs, Err(CronError::WatchClosed { .. })));

    let killer = tokio::time::timeout(Duration::from_secs(5), killer)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(killer, Err(CronError::WatchClosed { .. })));
}
