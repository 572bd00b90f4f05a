//! Worker side of the cluster.
//!
//! A worker keeps a local copy of the job registry, fires jobs on their
//! schedule and runs them under fleet-wide mutual exclusion:
//!
//! - [`sync::JobWatcher`] feeds registry changes and kill requests to the
//!   dispatcher
//! - [`Dispatcher`](crate::scheduler::Dispatcher) owns the schedule and the
//!   running executions
//! - [`JobExecutor`] takes the job's [`lock::DistributedLock`] and runs the
//!   command
//! - [`log_sink::LogSink`] batches execution logs into the log store
//! - [`registrar::Registrar`] publishes the worker's presence
//!
//! Commands run through the configured shell without sandboxing.

pub mod executor;
pub mod lock;
pub mod log_sink;
pub mod registrar;
pub mod sync;

use std::sync::Arc;

use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CronError, Result};
use crate::logstore::LogStore;
use crate::scheduler::Dispatcher;
use crate::store::CoordinationClient;

pub use executor::JobExecutor;
pub use lock::DistributedLock;
pub use log_sink::LogSink;
pub use registrar::{detect_worker_id, Registrar};
pub use sync::JobWatcher;

pub struct Worker {
    id: String,
    config: WorkerConfig,
    client: Arc<dyn CoordinationClient>,
    log_store: Arc<dyn LogStore>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        client: Arc<dyn CoordinationClient>,
        log_store: Arc<dyn LogStore>,
    ) -> Self {
        let id = config.worker_id.clone().unwrap_or_else(detect_worker_id);
        Self {
            id,
            config,
            client,
            log_store,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run until `shutdown` fires or a component fails.
    ///
    /// A closed registry watch or a dead dispatcher is fatal: the worker
    /// stops everything it started and returns the error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let local = shutdown.child_token();
        tracing::info!(worker = %self.id, "Worker starting");

        let (log_sink, sink_task) =
            LogSink::spawn(Arc::clone(&self.log_store), &self.config.log_sink, local.clone());
        let executor = Arc::new(JobExecutor::new(Arc::clone(&self.client), &self.config));
        let (dispatcher, events_tx) = Dispatcher::new(executor, Some(log_sink), &self.config);
        let mut dispatcher_task = tokio::spawn(dispatcher.run(local.clone()));

        let watcher = JobWatcher::new(Arc::clone(&self.client), local.clone());
        let watchers = async {
            let jobs = watcher.watch_jobs(events_tx.clone()).await?;
            let killer = watcher.watch_killer(events_tx).await?;
            Ok::<_, CronError>((jobs, killer))
        }
        .await;
        let (mut jobs_task, mut killer_task) = match watchers {
            Ok(tasks) => tasks,
            Err(e) => {
                local.cancel();
                let _ = dispatcher_task.await;
                let _ = sink_task.await;
                return Err(e);
            }
        };

        let registrar = Registrar::new(Arc::clone(&self.client), self.id.clone(), &self.config);
        let registrar_token = local.clone();
        let registrar_task = tokio::spawn(async move { registrar.run(registrar_token).await });

        let outcome = tokio::select! {
            r = &mut dispatcher_task => flatten("dispatcher", r),
            r = &mut jobs_task => flatten("job watcher", r),
            r = &mut killer_task => flatten("kill watcher", r),
        };

        local.cancel();
        // The task that ended the select has already been consumed.
        for task in [dispatcher_task, jobs_task, killer_task] {
            if !task.is_finished() {
                let _ = task.await;
            }
        }
        let _ = registrar_task.await;
        let _ = sink_task.await;

        match &outcome {
            Ok(()) => tracing::info!(worker = %self.id, "Worker stopped"),
            Err(e) => tracing::error!(worker = %self.id, error = %e, "Worker failed"),
        }
        outcome
    }
}

fn flatten(component: &str, joined: std::result::Result<Result<()>, JoinError>) -> Result<()> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(CronError::Internal(format!("{} task failed: {}", component, e))),
    }
}
