use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{CronError, Result};

/// Configuration for the in-process coordination store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StoreConfig {
    /// Number of committed revisions kept for watch replay.
    pub history_limit: usize,
    /// How often expired leases are swept when the store is otherwise idle.
    pub reap_interval_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            history_limit: 10_000,
            reap_interval_ms: 200,
        }
    }
}

/// Batching parameters for the worker's log sink.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LogSinkConfig {
    /// Flush as soon as this many entries are buffered.
    pub batch_size: usize,
    /// Flush whatever is buffered after this long without a flush.
    pub flush_interval_ms: u64,
    /// Capacity of the append queue. Entries beyond it are dropped.
    pub queue_capacity: usize,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            flush_interval_ms: 1000,
            queue_capacity: 5000,
        }
    }
}

/// Configuration for one worker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct WorkerConfig {
    /// Identity published under the worker namespace. Detected from the
    /// host's network interfaces when unset.
    pub worker_id: Option<String>,
    /// Shell used to run job commands as `<shell> -c <command>`.
    pub shell: String,
    /// Upper bound of the random delay applied before taking a job lock.
    pub jitter_max_ms: u64,
    /// TTL of the lease backing a job lock.
    pub lock_ttl_secs: i64,
    /// TTL of the presence lease.
    pub register_ttl_secs: i64,
    /// Pause before the registrar restarts a failed cycle.
    pub register_backoff_ms: u64,
    /// Dispatcher wake-up interval while no job is scheduled.
    pub idle_interval_ms: u64,
    /// Capacity of the dispatcher's job event queue.
    pub event_queue_capacity: usize,
    /// Capacity of the dispatcher's execution result queue.
    pub result_queue_capacity: usize,
    pub log_sink: LogSinkConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: None,
            shell: "/bin/bash".to_string(),
            jitter_max_ms: 1000,
            lock_ttl_secs: 5,
            register_ttl_secs: 10,
            register_backoff_ms: 1000,
            idle_interval_ms: 1000,
            event_queue_capacity: 1000,
            result_queue_capacity: 1000,
            log_sink: LogSinkConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub fn with_jitter_max_ms(mut self, jitter_max_ms: u64) -> Self {
        self.jitter_max_ms = jitter_max_ms;
        self
    }
}

/// Configuration for the master's control API.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MasterConfig {
    pub api_addr: SocketAddr,
    /// TTL of the lease attached to kill requests.
    pub kill_ttl_secs: i64,
    /// Page size used by log queries that do not specify a limit.
    pub default_log_limit: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            api_addr: SocketAddr::from(([127, 0, 0, 1], 8070)),
            kill_ttl_secs: 1,
            default_log_limit: 20,
        }
    }
}

/// Configuration for a single-process cluster: one store, one master and a
/// number of workers sharing them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ClusterConfig {
    pub master: MasterConfig,
    pub worker: WorkerConfig,
    pub store: StoreConfig,
    /// Number of workers started in this process.
    pub workers: usize,
    /// Append job logs to this JSON-lines file instead of keeping them in memory.
    pub log_file: Option<PathBuf>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            master: MasterConfig::default(),
            worker: WorkerConfig::default(),
            store: StoreConfig::default(),
            workers: 1,
            log_file: None,
        }
    }
}

impl ClusterConfig {
    /// Load a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            CronError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)
            .map_err(|e| CronError::Config(format!("invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(CronError::Config("workers must be at least 1".to_string()));
        }
        if self.worker.lock_ttl_secs <= 0 || self.worker.register_ttl_secs <= 0 {
            return Err(CronError::Config("lease TTLs must be positive".to_string()));
        }
        if self.worker.log_sink.batch_size == 0 || self.worker.log_sink.queue_capacity == 0 {
            return Err(CronError::Config(
                "log sink batch size and queue capacity must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
