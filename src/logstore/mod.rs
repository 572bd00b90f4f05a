//! Durable store for execution log entries.
//!
//! Workers append through the [`LogSink`](crate::worker::log_sink::LogSink),
//! which batches entries into [`LogStore::insert_many`]. The master serves
//! the log query API from [`LogStore::query`].

pub mod file;
pub mod memory;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::Result;
use crate::scheduler::JobLogEntry;

pub use file::FileLogStore;
pub use memory::MemoryLogStore;

/// Page of log entries for one job, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LogQuery {
    pub job_name: String,
    pub skip: usize,
    pub limit: usize,
}

impl LogQuery {
    pub fn new(job_name: impl Into<String>, skip: usize, limit: usize) -> Self {
        Self {
            job_name: job_name.into(),
            skip,
            limit,
        }
    }
}

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Insert a batch of entries. Either all of them are stored or the call
    /// fails.
    async fn insert_many(&self, entries: Vec<JobLogEntry>) -> Result<()>;

    /// Entries for `query.job_name` sorted by start time, newest first.
    async fn query(&self, query: &LogQuery) -> Result<Vec<JobLogEntry>>;
}

/// Filter, order and page entries for a query.
pub(crate) fn select_page(
    entries: impl IntoIterator<Item = JobLogEntry>,
    query: &LogQuery,
) -> Vec<JobLogEntry> {
    let mut matching: Vec<JobLogEntry> = entries
        .into_iter()
        .filter(|e| e.job_name == query.job_name)
        .collect();
    matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
    matching
        .into_iter()
        .skip(query.skip)
        .take(query.limit)
        .collect()
}
