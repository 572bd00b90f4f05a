use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::{ClusterConfig, WorkerConfig};
use crate::error::{CronError, Result};
use crate::logstore::{FileLogStore, LogStore, MemoryLogStore};
use crate::master::{run_api, ApiState};
use crate::store::{CoordinationClient, MemoryStore};
use crate::worker::{detect_worker_id, Worker};

/// Single-process cluster: an in-memory coordination store, the master API
/// and a set of workers all sharing it.
pub struct Node {
    config: ClusterConfig,
    store: Arc<MemoryStore>,
    log_store: Arc<dyn LogStore>,
}

impl Node {
    pub fn new(config: ClusterConfig) -> Self {
        let log_store: Arc<dyn LogStore> = match &config.log_file {
            Some(path) => Arc::new(FileLogStore::new(path)),
            None => Arc::new(MemoryLogStore::new()),
        };
        Self {
            store: Arc::new(MemoryStore::with_config(&config.store)),
            config,
            log_store,
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn log_store(&self) -> &Arc<dyn LogStore> {
        &self.log_store
    }

    /// Per-worker configs with distinct ids. A single worker keeps the
    /// configured id; several get `<base>-<n>` suffixes.
    pub fn worker_configs(&self) -> Vec<WorkerConfig> {
        let count = self.config.workers.max(1);
        if count == 1 {
            return vec![self.config.worker.clone()];
        }

        let base = self
            .config
            .worker
            .worker_id
            .clone()
            .unwrap_or_else(detect_worker_id);
        (1..=count)
            .map(|n| {
                self.config
                    .worker
                    .clone()
                    .with_worker_id(format!("{}-{}", base, n))
            })
            .collect()
    }

    /// Run every component until `shutdown` fires or one of them fails.
    ///
    /// 1. Starts the store's lease reaper
    /// 2. Serves the master API
    /// 3. Starts the workers
    ///
    /// # Errors
    ///
    /// Returns the first fatal error: the API failing to bind or serve, or a
    /// worker losing its registry watch. Everything else is stopped first.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let reaper = self.store.spawn_reaper(
            Duration::from_millis(self.config.store.reap_interval_ms.max(1)),
            shutdown.clone(),
        );
        let client: Arc<dyn CoordinationClient> = self.store.clone();

        let state = ApiState::new(
            Arc::clone(&client),
            Arc::clone(&self.log_store),
            &self.config.master,
        );
        let mut api = tokio::spawn(run_api(self.config.master.api_addr, state, shutdown.clone()));

        let mut workers = JoinSet::new();
        for config in self.worker_configs() {
            let worker = Worker::new(config, Arc::clone(&client), Arc::clone(&self.log_store));
            tracing::info!(worker = %worker.id(), "Spawning worker");
            workers.spawn(worker.run(shutdown.clone()));
        }

        let mut outcome = tokio::select! {
            _ = shutdown.cancelled() => Ok(()),
            r = &mut api => r.unwrap_or_else(|e| Err(CronError::Internal(format!("API task failed: {}", e)))),
            Some(r) = workers.join_next() => r.unwrap_or_else(|e| Err(CronError::Internal(format!("worker task failed: {}", e)))),
        };

        shutdown.cancel();
        if !api.is_finished() {
            if let Ok(Err(e)) = api.await {
                tracing::error!(error = %e, "API server failed during shutdown");
            }
        }
        while let Some(joined) = workers.join_next().await {
            let result = joined
                .unwrap_or_else(|e| Err(CronError::Internal(format!("worker task failed: {}", e))));
            if let Err(e) = result {
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        let _ = reaper.await;

        tracing::info!("Node stopped");
        outcome
    }
}
