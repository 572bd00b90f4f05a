//! Coordination store boundary.
//!
//! Workers and the master only talk to the shared store through
//! [`CoordinationClient`]. The store is expected to provide linearizable
//! reads/writes, revision-ordered prefix watches, TTL leases and one
//! compare-and-swap transaction shape (create-revision equality).
//!
//! [`MemoryStore`] is an in-process implementation of the same contract. It
//! backs the single-process cluster mode and every test that needs a store.

pub mod keys;
pub mod lease;
pub mod memory;

use std::pin::Pin;

use async_trait::async_trait;
use tokio_stream::Stream;

use crate::error::Result;

pub use lease::spawn_keep_alive;
pub use memory::MemoryStore;

/// Monotonic store revision. Every committed write bumps it by one.
pub type Revision = i64;

/// Identifier of a granted lease.
pub type LeaseId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
    /// Revision at which the key was created; 0 for a key that does not exist.
    pub create_revision: Revision,
    pub mod_revision: Revision,
    pub lease: Option<LeaseId>,
}

#[derive(Debug, Clone)]
pub struct GetResponse {
    /// Store revision the read was served at.
    pub revision: Revision,
    pub kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone)]
pub struct PutResponse {
    pub revision: Revision,
    pub prev_kv: Option<KeyValue>,
}

#[derive(Debug, Clone)]
pub struct DeleteResponse {
    pub revision: Revision,
    pub prev_kvs: Vec<KeyValue>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    Put,
    Delete,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub event_type: EventType,
    /// For deletes only `key` and `mod_revision` are meaningful.
    pub kv: KeyValue,
}

/// All events committed at one revision that match the watched prefix.
#[derive(Debug, Clone)]
pub struct WatchResponse {
    pub revision: Revision,
    pub events: Vec<WatchEvent>,
}

/// Stream of watch responses. It ends when the store drops the watcher.
pub type WatchStream = Pin<Box<dyn Stream<Item = WatchResponse> + Send>>;

#[derive(Debug, Clone, Copy)]
pub struct LeaseGrantResponse {
    pub id: LeaseId,
    pub ttl: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct LeaseKeepAliveResponse {
    pub id: LeaseId,
    pub ttl: i64,
}

/// Transaction predicate.
#[derive(Debug, Clone)]
pub enum Compare {
    /// Holds when the key's create revision equals `revision`
    /// (0 means the key does not exist).
    CreateRevision { key: String, revision: Revision },
}

impl Compare {
    pub fn create_revision(key: impl Into<String>, revision: Revision) -> Self {
        Compare::CreateRevision {
            key: key.into(),
            revision,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TxnOp {
    Put {
        key: String,
        value: Vec<u8>,
        lease: Option<LeaseId>,
    },
    Get {
        key: String,
    },
    Delete {
        key: String,
    },
}

impl TxnOp {
    pub fn put(key: impl Into<String>, value: impl Into<Vec<u8>>, lease: Option<LeaseId>) -> Self {
        TxnOp::Put {
            key: key.into(),
            value: value.into(),
            lease,
        }
    }

    pub fn get(key: impl Into<String>) -> Self {
        TxnOp::Get { key: key.into() }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        TxnOp::Delete { key: key.into() }
    }
}

#[derive(Debug, Clone)]
pub enum TxnOpResponse {
    Put(PutResponse),
    Get(GetResponse),
    Delete(DeleteResponse),
}

/// `if compares then success else failure`, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct Txn {
    pub compares: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compares: impl IntoIterator<Item = Compare>) -> Self {
        self.compares.extend(compares);
        self
    }

    pub fn and_then(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.success.extend(ops);
        self
    }

    pub fn or_else(mut self, ops: impl IntoIterator<Item = TxnOp>) -> Self {
        self.failure.extend(ops);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub revision: Revision,
    pub responses: Vec<TxnOpResponse>,
}

/// Client side of the coordination store.
///
/// Implementations must be safe to share across tasks; callers never wrap
/// them in an additional lock.
#[async_trait]
pub trait CoordinationClient: Send + Sync {
    /// Read a single key.
    async fn get(&self, key: &str) -> Result<GetResponse>;

    /// Read every key under `prefix`, sorted by key.
    async fn get_prefix(&self, prefix: &str) -> Result<GetResponse>;

    /// Write a key, optionally bound to a lease. Returns the previous value.
    async fn put(&self, key: &str, value: Vec<u8>, lease: Option<LeaseId>)
        -> Result<PutResponse>;

    /// Delete a key. Returns the removed value, if any.
    async fn delete(&self, key: &str) -> Result<DeleteResponse>;

    /// Watch every key under `prefix`. With `start_revision` the stream first
    /// replays all matching events at or after that revision.
    async fn watch_prefix(&self, prefix: &str, start_revision: Option<Revision>)
        -> Result<WatchStream>;

    async fn lease_grant(&self, ttl_secs: i64) -> Result<LeaseGrantResponse>;

    /// Refresh a lease's TTL once.
    async fn lease_keep_alive(&self, id: LeaseId) -> Result<LeaseKeepAliveResponse>;

    /// Revoke a lease, deleting every key attached to it.
    async fn lease_revoke(&self, id: LeaseId) -> Result<()>;

    async fn txn(&self, txn: Txn) -> Result<TxnResponse>;
}
