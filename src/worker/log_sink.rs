use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::LogSinkConfig;
use crate::logstore::LogStore;
use crate::scheduler::JobLogEntry;

/// Non-blocking handle for recording execution logs.
///
/// Entries are queued to a background writer that stores them in batches: a
/// batch is written when it reaches `batch_size` entries or when
/// `flush_interval` has passed since the last write, whichever comes first.
/// A full queue drops the entry instead of blocking the dispatcher.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::Sender<JobLogEntry>,
    dropped: Arc<AtomicU64>,
}

impl LogSink {
    /// Start the background writer. It stops after flushing what it holds
    /// when `shutdown` fires or every handle is dropped.
    pub fn spawn(
        store: Arc<dyn LogStore>,
        config: &LogSinkConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.queue_capacity.max(1));
        let writer = BatchWriter {
            store,
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_millis(config.flush_interval_ms),
        };
        let handle = tokio::spawn(writer.run(rx, shutdown));

        let sink = Self {
            tx,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (sink, handle)
    }

    /// Queue an entry. Returns false if it was dropped.
    pub fn append(&self, entry: JobLogEntry) -> bool {
        match self.tx.try_send(entry) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(entry)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(job = %entry.job_name, dropped, "Log queue full, dropping entry");
                false
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(job = %entry.job_name, "Log writer stopped, dropping entry");
                false
            }
        }
    }

    /// Number of entries dropped so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

struct BatchWriter {
    store: Arc<dyn LogStore>,
    batch_size: usize,
    flush_interval: Duration,
}

impl BatchWriter {
    async fn run(self, mut rx: mpsc::Receiver<JobLogEntry>, shutdown: CancellationToken) {
        let mut batch = Vec::with_capacity(self.batch_size);
        let timer = tokio::time::sleep(self.flush_interval);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                entry = rx.recv() => match entry {
                    Some(entry) => {
                        batch.push(entry);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                            timer.as_mut().reset(Instant::now() + self.flush_interval);
                        }
                    }
                    None => {
                        self.flush(&mut batch).await;
                        return;
                    }
                },
                _ = &mut timer => {
                    if !batch.is_empty() {
                        self.flush(&mut batch).await;
                    }
                    timer.as_mut().reset(Instant::now() + self.flush_interval);
                }
                _ = shutdown.cancelled() => {
                    rx.close();
                    while let Some(entry) = rx.recv().await {
                        batch.push(entry);
                        if batch.len() >= self.batch_size {
                            self.flush(&mut batch).await;
                        }
                    }
                    self.flush(&mut batch).await;
                    tracing::debug!("Log writer stopped");
                    return;
                }
            }
        }
    }

    async fn flush(&self, batch: &mut Vec<JobLogEntry>) {
        if batch.is_empty() {
            return;
        }
        let entries = std::mem::replace(batch, Vec::with_capacity(self.batch_size));
        let count = entries.len();
        match self.store.insert_many(entries).await {
            Ok(()) => tracing::debug!(entries = count, "Log batch stored"),
            // Not retried: the batch is gone.
            Err(e) => tracing::error!(entries = count, error = %e, "Failed to store log batch"),
        }
    }
}
