use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::config::StoreConfig;
use crate::error::{CronError, Result};
use crate::store::{
    Compare, CoordinationClient, DeleteResponse, EventType, GetResponse, KeyValue,
    LeaseGrantResponse, LeaseId, LeaseKeepAliveResponse, PutResponse, Revision, Txn, TxnOp,
    TxnOpResponse, TxnResponse, WatchEvent, WatchResponse, WatchStream,
};

/// In-process coordination store with etcd-like semantics.
///
/// - Every committed write gets the next revision; one transaction or one
///   lease revocation commits exactly one revision.
/// - A bounded history of committed revisions is kept so watches can resume
///   from an earlier revision. Older revisions are compacted away.
/// - Leases expire lazily on every call and, optionally, from a background
///   reaper so idle watchers still observe expiry deletes.
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchResponse>,
}

impl Watcher {
    /// Forward the events matching this watcher's prefix. Returns false once
    /// the receiving side is gone.
    fn notify(&self, response: &WatchResponse) -> bool {
        let events: Vec<WatchEvent> = response
            .events
            .iter()
            .filter(|e| e.kv.key.starts_with(&self.prefix))
            .cloned()
            .collect();

        if events.is_empty() {
            return !self.tx.is_closed();
        }

        self.tx
            .send(WatchResponse {
                revision: response.revision,
                events,
            })
            .is_ok()
    }
}

struct LeaseEntry {
    ttl: i64,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct StoreState {
    revision: Revision,
    /// Highest revision no longer available in `history`.
    compacted: Revision,
    kvs: BTreeMap<String, KeyValue>,
    history: VecDeque<WatchResponse>,
    history_limit: usize,
    watchers: Vec<Watcher>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease_id: LeaseId,
}

impl StoreState {
    fn new(history_limit: usize) -> Self {
        Self {
            revision: 1,
            compacted: 0,
            kvs: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit: history_limit.max(1),
            watchers: Vec::new(),
            leases: HashMap::new(),
            next_lease_id: 1,
        }
    }

    fn expire_leases(&mut self, now: Instant) {
        let expired: Vec<LeaseId> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            tracing::debug!(lease_id = id, "Lease expired");
            self.revoke(id);
        }
    }

    fn revoke(&mut self, id: LeaseId) -> bool {
        let Some(lease) = self.leases.remove(&id) else {
            return false;
        };

        let rev = self.revision + 1;
        let mut events = Vec::new();
        for key in lease.keys {
            if self.kvs.remove(&key).is_some() {
                events.push(delete_event(&key, rev));
            }
        }
        self.commit(rev, events);
        true
    }

    fn check_lease(&self, lease: Option<LeaseId>) -> Result<()> {
        match lease {
            Some(id) if !self.leases.contains_key(&id) => Err(CronError::LeaseNotFound(id)),
            _ => Ok(()),
        }
    }

    fn put_kv(
        &mut self,
        rev: Revision,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
        events: &mut Vec<WatchEvent>,
    ) -> Option<KeyValue> {
        let prev = self.kvs.get(key).cloned();

        if let Some(old) = prev.as_ref().and_then(|kv| kv.lease) {
            if Some(old) != lease {
                if let Some(entry) = self.leases.get_mut(&old) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(id) = lease {
            if let Some(entry) = self.leases.get_mut(&id) {
                entry.keys.insert(key.to_string());
            }
        }

        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
            mod_revision: rev,
            lease,
        };
        self.kvs.insert(key.to_string(), kv.clone());
        events.push(WatchEvent {
            event_type: EventType::Put,
            kv,
        });
        prev
    }

    fn delete_kv(
        &mut self,
        rev: Revision,
        key: &str,
        events: &mut Vec<WatchEvent>,
    ) -> Option<KeyValue> {
        let prev = self.kvs.remove(key)?;
        if let Some(id) = prev.lease {
            if let Some(entry) = self.leases.get_mut(&id) {
                entry.keys.remove(key);
            }
        }
        events.push(delete_event(key, rev));
        Some(prev)
    }

    fn read(&self, key: &str) -> GetResponse {
        GetResponse {
            revision: self.revision,
            kvs: self.kvs.get(key).cloned().into_iter().collect(),
        }
    }

    fn compare(&self, compare: &Compare) -> bool {
        match compare {
            Compare::CreateRevision { key, revision } => {
                self.kvs.get(key).map_or(0, |kv| kv.create_revision) == *revision
            }
        }
    }

    /// Publish the events of one revision. A commit with no events does not
    /// advance the revision.
    fn commit(&mut self, rev: Revision, events: Vec<WatchEvent>) {
        if events.is_empty() {
            return;
        }

        self.revision = rev;
        let response = WatchResponse {
            revision: rev,
            events,
        };
        self.watchers.retain(|w| w.notify(&response));
        self.history.push_back(response);

        while self.history.len() > self.history_limit {
            if let Some(dropped) = self.history.pop_front() {
                self.compacted = dropped.revision;
            }
        }
    }
}

fn delete_event(key: &str, rev: Revision) -> WatchEvent {
    WatchEvent {
        event_type: EventType::Delete,
        kv: KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: rev,
            lease: None,
        },
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_config(&StoreConfig::default())
    }

    pub fn with_config(config: &StoreConfig) -> Self {
        Self {
            state: Mutex::new(StoreState::new(config.history_limit)),
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> Revision {
        self.state.lock().await.revision
    }

    /// Number of live leases, after expiring overdue ones.
    pub async fn lease_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        state.leases.len()
    }

    /// Drop every open watch. Their streams end, as they would when the
    /// connection to a remote store is lost.
    pub async fn close_watchers(&self) {
        self.state.lock().await.watchers.clear();
    }

    /// Periodically expire leases so that watchers see expiry deletes even
    /// when nobody else is calling into the store.
    pub fn spawn_reaper(self: &Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        store.state.lock().await.expire_leases(Instant::now());
                    }
                }
            }
        })
    }

    async fn lock(&self) -> tokio::sync::MutexGuard<'_, StoreState> {
        let mut state = self.state.lock().await;
        state.expire_leases(Instant::now());
        state
    }
}

#[async_trait]
impl CoordinationClient for MemoryStore {
    async fn get(&self, key: &str) -> Result<GetResponse> {
        Ok(self.lock().await.read(key))
    }

    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse> {
        let state = self.lock().await;
        let kvs = state
            .kvs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, kv)| kv.clone())
            .collect();
        Ok(GetResponse {
            revision: state.revision,
            kvs,
        })
    }

    async fn put(
        &self,
        key: &str,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    ) -> Result<PutResponse> {
        let mut state = self.lock().await;
        state.check_lease(lease)?;

        let rev = state.revision + 1;
        let mut events = Vec::with_capacity(1);
        let prev_kv = state.put_kv(rev, key, value, lease, &mut events);
        state.commit(rev, events);

        Ok(PutResponse {
            revision: state.revision,
            prev_kv,
        })
    }

    async fn delete(&self, key: &str) -> Result<DeleteResponse> {
        let mut state = self.lock().await;

        let rev = state.revision + 1;
        let mut events = Vec::with_capacity(1);
        let prev = state.delete_kv(rev, key, &mut events);
        state.commit(rev, events);

        Ok(DeleteResponse {
            revision: state.revision,
            prev_kvs: prev.into_iter().collect(),
        })
    }

    async fn watch_prefix(
        &self,
        prefix: &str,
        start_revision: Option<Revision>,
    ) -> Result<WatchStream> {
        let mut state = self.lock().await;

        if let Some(start) = start_revision {
            if start <= state.compacted {
                return Err(CronError::Compacted {
                    requested: start,
                    compacted: state.compacted,
                });
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = Watcher {
            prefix: prefix.to_string(),
            tx,
        };

        // Replay and registration happen under the same lock, so no revision
        // can slip between the two.
        if let Some(start) = start_revision {
            for response in state.history.iter().filter(|r| r.revision >= start) {
                watcher.notify(response);
            }
        }
        state.watchers.push(watcher);

        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrantResponse> {
        if ttl_secs <= 0 {
            return Err(CronError::Store(format!(
                "lease TTL must be positive, got {ttl_secs}"
            )));
        }

        let mut state = self.lock().await;
        let id = state.next_lease_id;
        state.next_lease_id += 1;
        state.leases.insert(
            id,
            LeaseEntry {
                ttl: ttl_secs,
                deadline: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keys: BTreeSet::new(),
            },
        );

        Ok(LeaseGrantResponse { id, ttl: ttl_secs })
    }

    async fn lease_keep_alive(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse> {
        let mut state = self.lock().await;
        let lease = state
            .leases
            .get_mut(&id)
            .ok_or(CronError::LeaseNotFound(id))?;
        lease.deadline = Instant::now() + Duration::from_secs(lease.ttl as u64);

        Ok(LeaseKeepAliveResponse { id, ttl: lease.ttl })
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<()> {
        let mut state = self.lock().await;
        if state.revoke(id) {
            Ok(())
        } else {
            Err(CronError::LeaseNotFound(id))
        }
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResponse> {
        let mut state = self.lock().await;

        let succeeded = txn.compares.iter().all(|c| state.compare(c));
        let ops = if succeeded { txn.success } else { txn.failure };

        for op in &ops {
            if let TxnOp::Put { lease, .. } = op {
                state.check_lease(*lease)?;
            }
        }

        let rev = state.revision + 1;
        let mut events = Vec::new();
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                TxnOp::Put { key, value, lease } => {
                    let prev_kv = state.put_kv(rev, &key, value, lease, &mut events);
                    TxnOpResponse::Put(PutResponse {
                        revision: rev,
                        prev_kv,
                    })
                }
                TxnOp::Get { key } => TxnOpResponse::Get(state.read(&key)),
                TxnOp::Delete { key } => {
                    let prev = state.delete_kv(rev, &key, &mut events);
                    TxnOpResponse::Delete(DeleteResponse {
                        revision: rev,
                        prev_kvs: prev.into_iter().collect(),
                    })
                }
            };
            responses.push(response);
        }
        state.commit(rev, events);

        Ok(TxnResponse {
            succeeded,
            revision: state.revision,
            responses,
        })
    }
}
