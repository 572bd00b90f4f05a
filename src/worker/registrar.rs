use std::net::{IpAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::WorkerConfig;
use crate::error::{CronError, Result};
use crate::store::keys::worker_key;
use crate::store::{spawn_keep_alive, CoordinationClient, LeaseId, LeaseKeepAliveResponse};

/// Publishes this worker's presence under the workers namespace.
///
/// The presence key is bound to a lease that is kept alive for as long as
/// the worker runs, so a crashed worker disappears after the lease TTL. Any
/// failure (grant, put or a lost keep-alive) restarts the whole cycle after
/// a short backoff.
pub struct Registrar {
    client: Arc<dyn CoordinationClient>,
    worker_id: String,
    ttl_secs: i64,
    backoff: Duration,
}

impl Registrar {
    pub fn new(
        client: Arc<dyn CoordinationClient>,
        worker_id: impl Into<String>,
        config: &WorkerConfig,
    ) -> Self {
        Self {
            client,
            worker_id: worker_id.into(),
            ttl_secs: config.register_ttl_secs,
            backoff: Duration::from_millis(config.register_backoff_ms),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Stay registered until `shutdown` fires, then withdraw the presence key.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            match self.register_once(&shutdown).await {
                Ok(()) => return,
                Err(e) => {
                    tracing::warn!(worker = %self.worker_id, error = %e, "Registration lost, retrying");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.backoff) => {}
            }
        }
    }

    /// One registration cycle. Returns `Ok` only on shutdown.
    pub async fn register_once(&self, shutdown: &CancellationToken) -> Result<()> {
        let grant = self.client.lease_grant(self.ttl_secs).await?;
        let renewal = shutdown.child_token();
        let mut acks = spawn_keep_alive(
            Arc::clone(&self.client),
            grant.id,
            grant.ttl,
            renewal.clone(),
        );

        let outcome = self.hold(grant.id, &mut acks, shutdown).await;

        renewal.cancel();
        if let Err(e) = self.client.lease_revoke(grant.id).await {
            tracing::debug!(worker = %self.worker_id, lease_id = grant.id, error = %e, "Presence lease already gone");
        }
        if outcome.is_ok() {
            tracing::info!(worker = %self.worker_id, "Worker deregistered");
        }
        outcome
    }

    async fn hold(
        &self,
        lease_id: LeaseId,
        acks: &mut mpsc::Receiver<LeaseKeepAliveResponse>,
        shutdown: &CancellationToken,
    ) -> Result<()> {
        let key = worker_key(&self.worker_id);
        self.client.put(&key, Vec::new(), Some(lease_id)).await?;
        tracing::info!(worker = %self.worker_id, lease_id, "Worker registered");

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return Ok(()),
                ack = acks.recv() => {
                    if ack.is_none() {
                        return Err(CronError::KeepAliveLost(lease_id));
                    }
                }
            }
        }
    }
}

/// Pick an identity for this host: its outbound non-loopback IPv4 address,
/// falling back to the hostname.
pub fn detect_worker_id() -> String {
    if let Some(ip) = local_ipv4() {
        return ip;
    }
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

fn local_ipv4() -> Option<String> {
    // Connecting a UDP socket sends nothing; it only selects the route.
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(ip) if !ip.is_loopback() && !ip.is_unspecified() => Some(ip.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detected_id_is_never_empty() {
        assert!(!detect_worker_id().is_empty());
    }
}
