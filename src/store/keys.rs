//! Key layout shared by the master and the workers.

/// Job definitions, one JSON-encoded [`Job`](crate::scheduler::Job) per key.
pub const JOBS_DIR: &str = "/cron/jobs/";

/// Kill requests. Keys are written with a short lease and expire on their own.
pub const KILLER_DIR: &str = "/cron/killer/";

/// Per-job execution locks.
pub const LOCK_DIR: &str = "/cron/lock/";

/// Worker presence keys, bound to each worker's registration lease.
pub const WORKERS_DIR: &str = "/cron/workers/";

pub fn job_key(name: &str) -> String {
    format!("{JOBS_DIR}{name}")
}

pub fn killer_key(name: &str) -> String {
    format!("{KILLER_DIR}{name}")
}

pub fn lock_key(name: &str) -> String {
    format!("{LOCK_DIR}{name}")
}

pub fn worker_key(id: &str) -> String {
    format!("{WORKERS_DIR}{id}")
}

pub fn extract_job_name(key: &str) -> Option<&str> {
    key.strip_prefix(JOBS_DIR).filter(|n| !n.is_empty())
}

pub fn extract_killer_name(key: &str) -> Option<&str> {
    key.strip_prefix(KILLER_DIR).filter(|n| !n.is_empty())
}

pub fn extract_worker_id(key: &str) -> Option<&str> {
    key.strip_prefix(WORKERS_DIR).filter(|n| !n.is_empty())
}
