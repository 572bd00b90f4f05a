
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use distcron::config::LogSinkConfig;
use distcron::logstore::MemoryLogStore;
use distcron::worker::LogSink;
use test_harness::{log_entry, FailingLogStore};

fn spawn_sink(
    store: Arc<MemoryLogStore>,
    config: LogSinkConfig,
) -> (LogSink, tokio::task::JoinHandle<()>, CancellationToken) {
    let shutdown = CancellationToken::new();
    let (sink, writer) = LogSink::spawn(store, &config, shutdown.clone());
    (sink, writer, shutdown)
}

#[tokio::test(start_paused = true)]
async fn test_burst_flushes_full_batches_then_timer_remainder() {
    let store = Arc::new(MemoryLogStore::new());
    let (sink, _writer, _shutdown) = spawn_sink(store.clone(), LogSinkConfig::default());

    for i in 0..120 {
        assert!(sink.append(log_entry("j1", i)));
    }

    tokio::time::sleep(Duration::from_millis(1_100)).await;

    assert_eq!(store.batch_sizes().await, vec![50, 50, 20]);
    assert_eq!(store.len().await, 120);
    assert_eq!(sink.dropped(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_small_batch_flushes_on_timer() {
    let store = Arc::new(MemoryLogStore::new());
    let (sink, _writer, _shutdown) = spawn_sink(store.clone(), LogSinkConfig::default());

    for i in 0..3 {
        sink.append(log_entry("j1", i));
    }

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(store.batch_sizes().await.is_empty());

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.batch_sizes().await, vec![3]);
}

#[tokio::test(start_paused = true)]
async fn test_timer_restarts_after_size_flush() {
    let store = Arc::new(MemoryLogStore::new());
    let config = LogSinkConfig {
        batch_size: 2,
        ..LogSinkConfig::default()
    };
    let (sink, _writer, _shutdown) = spawn_sink(store.clone(), config);

    tokio::time::sleep(Duration::from_millis(800)).await;
    sink.append(log_entry("j1", 1));
    sink.append(log_entry("j1", 2));
    sink.append(log_entry("j1", 3));

    // The size flush at 800ms pushed the next timer flush to 1800ms.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(store.batch_sizes().await, vec![2]);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(store.batch_sizes().await, vec![2, 1]);
}

#[tokio::test]
async fn test_full_queue_drops_entries() {
    let store = Arc::new(MemoryLogStore::new());
    let config = LogSinkConfig {
        queue_capacity: 2,
        ..LogSinkConfig::default()
    };
    let (sink, writer, shutdown) = spawn_sink(store.clone(), config);

    // The writer does not run until this task yields, so the queue fills.
    let accepted: Vec<bool> = (0..5).map(|i| sink.append(log_entry("j1", i))).collect();
    assert_eq!(accepted, vec![true, true, false, false, false]);
    assert_eq!(sink.dropped(), 3);

    shutdown.cancel();
    writer.await.unwrap();
    assert_eq!(store.len().await, 2);
}

#[tokio::test(start_paused = true)]
async fn test_failed_insert_is_discarded() {
    let store = Arc::new(FailingLogStore::default());
    let shutdown = CancellationToken::new();
    let (sink, _writer) = LogSink::spawn(store.clone(), &LogSinkConfig::default(), shutdown);

    for i in 0..3 {
        sink.append(log_entry("j1", i));
    }
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    sink.append(log_entry("j1", 10));
    sink.append(log_entry("j1", 11));
    tokio::time::sleep(Duration::from_millis(1_100)).await;

    // The first batch was not retried along with the second.
    assert_eq!(*store.batches.lock().unwrap(), vec![3, 2]);
}

#[tokio::test]
async fn test_shutdown_flushes_pending_batch() {
    let store = Arc::new(MemoryLogStore::new());
    let (sink, writer, shutdown) = spawn_sink(store.clone(), LogSinkConfig::default());

    for i in 0..3 {
        sink.append(log_entry("j1", i));
    }
    shutdown.cancel();
    writer.await.unwrap();

    assert_eq!(store.batch_sizes().await, vec![3]);
}

#[tokio::test]
async fn test_dropping_every_handle_flushes() {
    let store = Arc::new(MemoryLogStore::new());
    let (sink, writer, _shutdown) = spawn_sink(store.clone(), LogSinkConfig::default());
    let clone = sink.clone();

    sink.append(log_entry("j1", 1));
    clone.append(log_entry("j2", 2));
    drop(sink);
    drop(clone);
    writer.await.unwrap();

    assert_eq!(store.batch_sizes().await, vec![2]);
}
