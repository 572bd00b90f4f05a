use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::{CronError, Result};
use crate::logstore::{select_page, LogQuery, LogStore};
use crate::scheduler::JobLogEntry;

/// Log store backed by a JSON-lines file, one entry per line.
///
/// Batches are appended with a single write. Queries scan the whole file and
/// skip lines that do not parse, so a torn final line after a crash only
/// loses that entry.
#[derive(Debug)]
pub struct FileLogStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLogStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl LogStore for FileLogStore {
    async fn insert_many(&self, entries: Vec<JobLogEntry>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| CronError::LogStore(format!("open {}: {}", self.path.display(), e)))?;
        file.write_all(&buf).await?;
        file.flush().await?;
        Ok(())
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<JobLogEntry>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let entries = contents
            .lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .filter_map(|(n, line)| match serde_json::from_str::<JobLogEntry>(line) {
                Ok(entry) => Some(entry),
                Err(e) => {
                    tracing::warn!(path = %self.path.display(), line = n + 1, error = %e, "Skipping malformed log line");
                    None
                }
            });

        Ok(select_page(entries, query))
    }
}
