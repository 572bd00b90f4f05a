use thiserror::Error;

use crate::cron::CronParseError;
use crate::store::{LeaseId, Revision};

#[derive(Error, Debug)]
pub enum CronError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Lease not found: {0}")]
    LeaseNotFound(LeaseId),

    #[error("Revision {requested} has been compacted (oldest available is {compacted})")]
    Compacted {
        requested: Revision,
        compacted: Revision,
    },

    #[error("Watch on {prefix} closed")]
    WatchClosed { prefix: String },

    #[error("Keepalive stream for lease {0} ended")]
    KeepAliveLost(LeaseId),

    #[error("Job event queue closed")]
    EventQueueClosed,

    #[error("Invalid cron expression: {0}")]
    InvalidCron(#[from] CronParseError),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Log store error: {0}")]
    LogStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CronError>;

/// Outcome of a failed lock acquisition.
#[derive(Error, Debug)]
pub enum LockError {
    #[error("lock already held by another worker")]
    AlreadyHeld,

    #[error("lock acquisition failed: {0}")]
    Store(#[from] CronError),
}

/// Why a single job execution did not succeed. Carried as result data,
/// never propagated as a system error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecuteError {
    #[error("lock already held by another worker")]
    LockHeld,

    #[error("lock acquisition failed: {0}")]
    Lock(String),

    #[error("failed to spawn command: {0}")]
    Spawn(String),

    #[error("{0}")]
    Exit(String),

    #[error("killed")]
    Killed,
}

impl From<LockError> for ExecuteError {
    fn from(e: LockError) -> Self {
        match e {
            LockError::AlreadyHeld => ExecuteError::LockHeld,
            LockError::Store(e) => ExecuteError::Lock(e.to_string()),
        }
    }
}
