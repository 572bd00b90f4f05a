use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::error::{CronError, Result};
use crate::scheduler::{Job, JobEvent};
use crate::store::keys::{extract_job_name, extract_killer_name, JOBS_DIR, KILLER_DIR};
use crate::store::{CoordinationClient, EventType, WatchEvent, WatchStream};

/// Mirrors the shared job registry into the dispatcher's event queue.
///
/// Two independent feeds:
/// - the jobs namespace: a snapshot followed by a watch starting right after
///   the snapshot revision, so no change is lost or applied twice
/// - the kill namespace: a watch starting now, since kill requests are
///   only meaningful while they are fresh
///
/// A watch that ends is an error. The dispatcher would otherwise keep
/// scheduling from a stale table.
pub struct JobWatcher {
    client: Arc<dyn CoordinationClient>,
    shutdown: CancellationToken,
}

impl JobWatcher {
    pub fn new(client: Arc<dyn CoordinationClient>, shutdown: CancellationToken) -> Self {
        Self { client, shutdown }
    }

    /// Send an upsert for every stored job, then follow the jobs namespace.
    ///
    /// The snapshot is delivered before this returns. The returned task
    /// resolves with [`CronError::WatchClosed`] if the watch ends.
    pub async fn watch_jobs(
        &self,
        events: mpsc::Sender<JobEvent>,
    ) -> Result<JoinHandle<Result<()>>> {
        let snapshot = self.client.get_prefix(JOBS_DIR).await?;

        let mut loaded = 0usize;
        for kv in &snapshot.kvs {
            match Job::from_bytes(&kv.value) {
                Ok(job) => {
                    events
                        .send(JobEvent::Upsert(job))
                        .await
                        .map_err(|_| CronError::EventQueueClosed)?;
                    loaded += 1;
                }
                Err(e) => {
                    tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job");
                }
            }
        }

        let stream = self
            .client
            .watch_prefix(JOBS_DIR, Some(snapshot.revision + 1))
            .await?;
        tracing::info!(revision = snapshot.revision, jobs = loaded, "Job registry loaded");

        Ok(tokio::spawn(forward(
            stream,
            events,
            JOBS_DIR,
            translate_job_event,
            self.shutdown.clone(),
        )))
    }

    /// Follow the kill namespace from the current revision.
    pub async fn watch_killer(
        &self,
        events: mpsc::Sender<JobEvent>,
    ) -> Result<JoinHandle<Result<()>>> {
        let stream = self.client.watch_prefix(KILLER_DIR, None).await?;
        Ok(tokio::spawn(forward(
            stream,
            events,
            KILLER_DIR,
            translate_kill_event,
            self.shutdown.clone(),
        )))
    }
}

/// Map a jobs-namespace event to a job event. Malformed values and keys
/// outside the namespace yield `None`.
pub fn translate_job_event(event: &WatchEvent) -> Option<JobEvent> {
    match event.event_type {
        EventType::Put => match Job::from_bytes(&event.kv.value) {
            Ok(job) => Some(JobEvent::Upsert(job)),
            Err(e) => {
                tracing::warn!(key = %event.kv.key, error = %e, "Ignoring malformed job update");
                None
            }
        },
        EventType::Delete => extract_job_name(&event.kv.key).map(|name| JobEvent::Delete {
            name: name.to_string(),
        }),
    }
}

/// Map a kill-namespace event to a kill request. Deletes are lease expiry
/// of old requests and carry no meaning.
pub fn translate_kill_event(event: &WatchEvent) -> Option<JobEvent> {
    match event.event_type {
        EventType::Put => extract_killer_name(&event.kv.key).map(|name| JobEvent::Kill {
            name: name.to_string(),
        }),
        EventType::Delete => None,
    }
}

async fn forward(
    mut stream: WatchStream,
    events: mpsc::Sender<JobEvent>,
    prefix: &'static str,
    translate: fn(&WatchEvent) -> Option<JobEvent>,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let response = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            response = stream.next() => response,
        };

        let Some(response) = response else {
            tracing::error!(prefix, "Watch stream ended");
            return Err(CronError::WatchClosed {
                prefix: prefix.to_string(),
            });
        };

        for event in response.events.iter().filter_map(translate) {
            tracing::debug!(prefix, job = %event.name(), revision = response.revision, "Forwarding job event");
            if events.send(event).await.is_err() {
                // Dispatcher is gone; the worker is shutting down.
                return Ok(());
            }
        }
    }
}
