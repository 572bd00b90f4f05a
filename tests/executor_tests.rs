
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use distcron::error::ExecuteError;
use distcron::scheduler::{ExecutionRecord, Job, JobRunner};
use distcron::store::keys::lock_key;
use distcron::store::{CoordinationClient, MemoryStore};
use distcron::worker::{DistributedLock, JobExecutor};
use test_harness::test_worker_config;
use tokio::sync::mpsc;

/// Create a test executor over a fresh store, without jitter
fn test_executor() -> (JobExecutor, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let executor = JobExecutor::new(store.clone(), &test_worker_config("w1"));
    (executor, store)
}

fn record(name: &str, command: &str) -> ExecutionRecord {
    let now = Utc::now();
    ExecutionRecord::new(Job::new(name, command, "* * * * * *"), now, now)
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (executor, _store) = test_executor();
    let record = record("j1", "echo hello");
    let id = record.id;

    let result = executor.execute(record).await;

    assert_eq!(result.record.id, id);
    assert_eq!(result.output, "hello\n");
    assert!(result.error.is_none());
    assert!(result.start_time <= result.end_time);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (executor, _store) = test_executor();

    let result = executor.execute(record("j1", "true")).await;

    assert_eq!(result.output, "");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_large_output() {
    let (executor, _store) = test_executor();

    // Generate large output (1000 lines)
    let result = executor.execute(record("j1", "seq 1 1000")).await;

    assert!(result.error.is_none());
    assert_eq!(result.output.lines().count(), 1000);
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (executor, _store) = test_executor();

    let result = executor.execute(record("j1", "exit 3")).await;

    assert_eq!(
        result.error,
        Some(ExecuteError::Exit("exit status 3".to_string()))
    );
}

#[tokio::test]
async fn test_execute_captures_stdout_and_stderr() {
    let (executor, _store) = test_executor();

    let result = executor
        .execute(record("j1", "echo out; echo 'error message' >&2; echo after; exit 1"))
        .await;

    assert_eq!(result.output, "out\nerror message\nafter\n");
    assert!(matches!(result.error, Some(ExecuteError::Exit(_))));
}

#[tokio::test]
async fn test_execute_keeps_write_order_across_streams() {
    let (executor, _store) = test_executor();

    let result = executor
        .execute(record("j1", "echo first >&2; echo second"))
        .await;

    assert_eq!(result.output, "first\nsecond\n");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_waits_for_output_after_exit() {
    let (executor, _store) = test_executor();

    // A background writer keeps the pipe open after the shell exits.
    let result = executor
        .execute(record("j1", "(sleep 0.2; echo late) & echo early"))
        .await;

    assert_eq!(result.output, "early\nlate\n");
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let (executor, _store) = test_executor();

    // The shell reports the missing command as exit status 127
    let result = executor
        .execute(record("j1", "nonexistent_command_12345"))
        .await;

    assert!(matches!(result.error, Some(ExecuteError::Exit(_))));
}

#[tokio::test]
async fn test_execute_missing_shell_is_spawn_error() {
    let store = Arc::new(MemoryStore::new());
    let mut config = test_worker_config("w1");
    config.shell = "/nonexistent/shell".to_string();
    let executor = JobExecutor::new(store.clone(), &config);

    let result = executor.execute(record("j1", "echo hi")).await;

    assert!(matches!(result.error, Some(ExecuteError::Spawn(_))));
    // The lock is still released.
    assert!(store.get(&lock_key("j1")).await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn test_execute_piped_commands() {
    let (executor, _store) = test_executor();

    let result = executor
        .execute(record("j1", "echo 'hello world' | wc -w"))
        .await;

    assert!(result.error.is_none());
    assert_eq!(result.output.trim(), "2");
}

#[tokio::test]
async fn test_execute_with_special_characters() {
    let (executor, _store) = test_executor();

    let result = executor.execute(record("j1", "echo 'hello $USER'")).await;

    // Single quotes prevent variable expansion
    assert_eq!(result.output, "hello $USER\n");
}

#[tokio::test]
async fn test_lock_released_after_execution() {
    let (executor, store) = test_executor();

    let result = executor.execute(record("j1", "echo hi")).await;
    assert!(result.error.is_none());

    assert!(store.get(&lock_key("j1")).await.unwrap().kvs.is_empty());
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_execute_reports_lock_held() {
    let (executor, store) = test_executor();
    let mut holder = DistributedLock::new(store.clone(), "j1", 5);
    holder.try_acquire().await.unwrap();

    let result = executor.execute(record("j1", "echo hi")).await;

    assert_eq!(result.error, Some(ExecuteError::LockHeld));
    assert_eq!(result.output, "");
    assert!(result.start_time <= result.end_time);

    holder.release().await;
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_cancel_kills_running_command() {
    let (executor, store) = test_executor();
    let record = record("j1", "sleep 30");
    let cancel = record.cancel.clone();

    let task = tokio::spawn(async move { executor.execute(record).await });
    tokio::time::sleep(Duration::from_millis(200)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("execution did not stop after cancel")
        .unwrap();

    assert_eq!(result.error, Some(ExecuteError::Killed));
    assert!(store.get(&lock_key("j1")).await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn test_cancel_keeps_partial_output() {
    let (executor, store) = test_executor();
    let record = record("j1", "echo started; sleep 5");
    let cancel = record.cancel.clone();

    let task = tokio::spawn(async move { executor.execute(record).await });
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    // The orphaned sleep still holds the pipe; the kill must not wait for it.
    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("execution did not stop after cancel")
        .unwrap();

    assert_eq!(result.error, Some(ExecuteError::Killed));
    assert_eq!(result.output, "started\n");
    assert!(store.get(&lock_key("j1")).await.unwrap().kvs.is_empty());
}

#[tokio::test]
async fn test_default_shell_runs_bash_syntax() {
    let (executor, _store) = test_executor();

    let result = executor
        .execute(record("j1", "set -o pipefail; [[ abc == a* ]] && echo matched"))
        .await;

    assert!(result.error.is_none(), "{:?}", result.error);
    assert_eq!(result.output, "matched\n");
}

#[tokio::test]
async fn test_cancel_during_jitter_skips_lock() {
    let store = Arc::new(MemoryStore::new());
    let config = test_worker_config("w1").with_jitter_max_ms(60_000);
    let executor = JobExecutor::new(store.clone(), &config);
    let record = record("j1", "echo hi");
    record.cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), executor.execute(record))
        .await
        .unwrap();

    assert_eq!(result.error, Some(ExecuteError::Killed));
    assert_eq!(store.lease_count().await, 0);
}

#[tokio::test]
async fn test_launch_delivers_result() {
    let (executor, _store) = test_executor();
    let (tx, mut rx) = mpsc::channel(1);
    let record = record("j1", "echo launched");
    let id = record.id;

    executor.launch(record, tx);

    let result = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.record.id, id);
    assert_eq!(result.output, "launched\n");
}
