use std::sync::Arc;

use crate::error::Result;
use crate::store::keys::{extract_worker_id, WORKERS_DIR};
use crate::store::CoordinationClient;

pub struct WorkerManager {
    client: Arc<dyn CoordinationClient>,
}

impl WorkerManager {
    pub fn new(client: Arc<dyn CoordinationClient>) -> Self {
        Self { client }
    }

    /// Ids of the workers currently holding a presence lease.
    pub async fn list_workers(&self) -> Result<Vec<String>> {
        let response = self.client.get_prefix(WORKERS_DIR).await?;
        Ok(response
            .kvs
            .iter()
            .filter_map(|kv| extract_worker_id(&kv.key))
            .map(str::to_string)
            .collect())
    }
}
