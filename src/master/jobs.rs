use std::sync::Arc;

use crate::error::Result;
use crate::scheduler::Job;
use crate::store::keys::{job_key, killer_key, JOBS_DIR};
use crate::store::{CoordinationClient, KeyValue};

/// Registry operations behind the job endpoints.
pub struct JobManager {
    client: Arc<dyn CoordinationClient>,
    kill_ttl_secs: i64,
}

impl JobManager {
    pub fn new(client: Arc<dyn CoordinationClient>, kill_ttl_secs: i64) -> Self {
        Self {
            client,
            kill_ttl_secs,
        }
    }

    /// Create or replace a job. Returns the definition it replaced.
    pub async fn save_job(&self, job: &Job) -> Result<Option<Job>> {
        job.validate()?;
        let response = self
            .client
            .put(&job_key(&job.name), job.to_bytes()?, None)
            .await?;
        tracing::info!(job = %job.name, cron = %job.cron_expr, "Job saved");
        Ok(response.prev_kv.as_ref().and_then(decode))
    }

    /// Remove a job. Returns the removed definition, `None` if there was none.
    pub async fn delete_job(&self, name: &str) -> Result<Option<Job>> {
        let response = self.client.delete(&job_key(name)).await?;
        let removed = response.prev_kvs.first().and_then(decode);
        if removed.is_some() {
            tracing::info!(job = %name, "Job deleted");
        }
        Ok(removed)
    }

    /// Every stored job, sorted by name.
    pub async fn list_jobs(&self) -> Result<Vec<Job>> {
        let response = self.client.get_prefix(JOBS_DIR).await?;
        Ok(response.kvs.iter().filter_map(decode).collect())
    }

    /// Ask every worker to kill the running execution of `name`.
    ///
    /// The request is a key under the kill namespace bound to a short lease,
    /// so it cleans itself up. Workers only react to the put.
    pub async fn kill_job(&self, name: &str) -> Result<()> {
        let grant = self.client.lease_grant(self.kill_ttl_secs).await?;
        self.client
            .put(&killer_key(name), Vec::new(), Some(grant.id))
            .await?;
        tracing::info!(job = %name, lease_id = grant.id, "Kill requested");
        Ok(())
    }
}

fn decode(kv: &KeyValue) -> Option<Job> {
    match Job::from_bytes(&kv.value) {
        Ok(job) => Some(job),
        Err(e) => {
            tracing::warn!(key = %kv.key, error = %e, "Skipping malformed job");
            None
        }
    }
}
