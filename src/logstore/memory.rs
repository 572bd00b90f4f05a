use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::logstore::{select_page, LogQuery, LogStore};
use crate::scheduler::JobLogEntry;

/// Log store kept in process memory. Used when no log file is configured.
#[derive(Debug, Default)]
pub struct MemoryLogStore {
    entries: RwLock<Vec<JobLogEntry>>,
    batches: RwLock<Vec<usize>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Every stored entry in insertion order.
    pub async fn entries(&self) -> Vec<JobLogEntry> {
        self.entries.read().await.clone()
    }

    /// Sizes of the batches received through `insert_many`, in order.
    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batches.read().await.clone()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn insert_many(&self, entries: Vec<JobLogEntry>) -> Result<()> {
        self.batches.write().await.push(entries.len());
        self.entries.write().await.extend(entries);
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<JobLogEntry>> {
        let entries = self.entries.read().await;
        Ok(select_page(entries.iter().cloned(), query))
    }
}
