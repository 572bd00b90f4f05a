use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;
use crate::store::keys::lock_key;
use crate::store::{
    spawn_keep_alive, Compare, CoordinationClient, LeaseId, LeaseKeepAliveResponse, Txn, TxnOp,
    TxnOpResponse,
};

struct LockLease {
    id: LeaseId,
    renewal: CancellationToken,
    // Renewal stops once this receiver is dropped.
    _acks: mpsc::Receiver<LeaseKeepAliveResponse>,
}

/// Fleet-wide mutual exclusion for one job.
///
/// Acquisition:
/// 1. Grant a short-TTL lease and keep it alive in the background
/// 2. In one transaction, create the lock key bound to the lease if its
///    create revision is 0 (nobody holds it), otherwise read the holder
/// 3. On any failure stop the renewal and revoke the lease
///
/// The lease gives crash recovery: a holder that dies stops renewing and the
/// key disappears after the TTL. The transaction gives atomicity across
/// racing workers.
pub struct DistributedLock {
    client: Arc<dyn CoordinationClient>,
    job_name: String,
    ttl_secs: i64,
    lease: Option<LockLease>,
    locked: bool,
}

impl DistributedLock {
    pub fn new(client: Arc<dyn CoordinationClient>, job_name: impl Into<String>, ttl_secs: i64) -> Self {
        Self {
            client,
            job_name: job_name.into(),
            ttl_secs,
            lease: None,
            locked: false,
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Try once to take the lock. Never waits for a current holder.
    pub async fn try_acquire(&mut self) -> Result<(), LockError> {
        if self.locked {
            return Ok(());
        }

        let grant = self.client.lease_grant(self.ttl_secs).await?;
        let renewal = CancellationToken::new();
        let acks = spawn_keep_alive(
            Arc::clone(&self.client),
            grant.id,
            grant.ttl,
            renewal.clone(),
        );
        // Recorded before the transaction so a dropped acquisition can still
        // be cleaned up by `release`.
        self.lease = Some(LockLease {
            id: grant.id,
            renewal,
            _acks: acks,
        });

        let key = lock_key(&self.job_name);
        let txn = Txn::new()
            .when([Compare::create_revision(key.clone(), 0)])
            .and_then([TxnOp::put(key.clone(), Vec::new(), Some(grant.id))])
            .or_else([TxnOp::get(key)]);

        match self.client.txn(txn).await {
            Ok(response) if response.succeeded => {
                self.locked = true;
                tracing::debug!(job = %self.job_name, lease_id = grant.id, "Lock acquired");
                Ok(())
            }
            Ok(response) => {
                let holder = response.responses.iter().find_map(|r| match r {
                    TxnOpResponse::Get(get) => get.kvs.first().and_then(|kv| kv.lease),
                    _ => None,
                });
                tracing::debug!(job = %self.job_name, holder_lease = ?holder, "Lock already held");
                self.release().await;
                Err(LockError::AlreadyHeld)
            }
            Err(e) => {
                self.release().await;
                Err(LockError::Store(e))
            }
        }
    }

    /// Give the lock up by revoking its lease, which deletes the lock key.
    /// Safe to call repeatedly and after a failed acquisition.
    pub async fn release(&mut self) {
        self.locked = false;
        let Some(lease) = self.lease.take() else {
            return;
        };

        lease.renewal.cancel();
        if let Err(e) = self.client.lease_revoke(lease.id).await {
            // The lease still expires on its own after the TTL.
            tracing::warn!(job = %self.job_name, lease_id = lease.id, error = %e, "Failed to revoke lock lease");
        }
    }
}

impl Drop for DistributedLock {
    fn drop(&mut self) {
        if let Some(lease) = &self.lease {
            lease.renewal.cancel();
        }
    }
}
