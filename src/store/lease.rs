use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::{CoordinationClient, LeaseId, LeaseKeepAliveResponse};

const ACK_BUFFER: usize = 16;

/// Keep a lease alive in the background.
///
/// The lease is refreshed immediately and then every third of its TTL until
/// `cancel` fires or a refresh fails. Each successful refresh is acknowledged
/// on the returned channel; the channel closes when renewal stops. Acks are
/// dropped rather than queued if the receiver falls behind, so holding the
/// receiver without reading it is fine. Dropping the receiver stops renewal.
pub fn spawn_keep_alive(
    client: Arc<dyn CoordinationClient>,
    lease_id: LeaseId,
    ttl_secs: i64,
    cancel: CancellationToken,
) -> mpsc::Receiver<LeaseKeepAliveResponse> {
    let (tx, rx) = mpsc::channel(ACK_BUFFER);
    let period = Duration::from_millis(((ttl_secs.max(1) as u64) * 1000 / 3).max(100));

    tokio::spawn(async move {
        loop {
            let renewal = tokio::select! {
                _ = cancel.cancelled() => return,
                r = client.lease_keep_alive(lease_id) => r,
            };

            match renewal {
                Ok(ack) => match tx.try_send(ack) {
                    Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => return,
                },
                Err(e) => {
                    tracing::debug!(lease_id, error = %e, "Lease keepalive stopped");
                    return;
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
        }
    });

    rx
}
