//! Client surface
//!
//! The [`CacheClient`] trait is the API applications program against. It is
//! deliberately forgiving: a degraded or unreachable cache reports misses and
//! failed writes instead of surfacing transport errors on every call, because
//! a cache outage should cost performance, not correctness. Failures are
//! still visible through the [`crate::hook::ObservabilityHook`].

use std::collections::HashMap;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// One entry of a batched write. `ttl` overrides the batch-level TTL when
/// present, using the usual convention (`None` default, `Some(0)` forever).
#[derive(Debug, Clone)]
pub struct WriteEntry<T> {
    pub key: String,
    pub value: T,
    pub ttl: Option<u64>,
}

impl<T> WriteEntry<T> {
    pub fn new(key: impl Into<String>, value: T) -> Self {
        WriteEntry {
            key: key.into(),
            value,
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Unified cache operations over any topology.
///
/// Writes are deferred: `set`, `set_multiple` and the delete operations stage
/// into a transaction buffer that `commit` flushes to the backend. Reads see
/// staged state first. `cas_get`/`cas_set` bypass the buffer and speak to the
/// backend directly, carrying version tokens in an internal ledger.
#[async_trait]
pub trait CacheClient: Send + Sync {
    /// Staged-write-aware read. Decode failures count as misses.
    async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send;

    /// Stage a write. When a CAS token is on ledger for this key the write
    /// goes straight to the backend as a conditioned swap instead.
    async fn set<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync;

    /// Read a value and capture its version token for a later [`cas_set`].
    ///
    /// [`cas_set`]: CacheClient::cas_set
    async fn cas_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send;

    /// Conditioned write. Uses `token` when given, otherwise the ledger entry
    /// captured by the last `cas_get` of this key. With neither, fails
    /// without touching the backend.
    async fn cas_set<T>(&self, key: &str, value: &T, ttl: Option<u64>, token: Option<crate::backend::CasToken>) -> bool
    where
        T: Serialize + Sync;

    /// Stage a delete. Always acknowledged; the backend delete happens at
    /// commit time.
    async fn delete(&self, key: &str) -> bool;

    /// Drop local state and flush every backend node.
    async fn clear(&self) -> bool;

    /// Batched read; missing and undecodable keys are absent from the map.
    async fn get_multiple<T>(&self, keys: &[&str]) -> HashMap<String, T>
    where
        T: DeserializeOwned + Send;

    /// Stage a batch of writes. `ttl` applies to entries without their own.
    async fn set_multiple<T>(&self, entries: Vec<WriteEntry<T>>, ttl: Option<u64>) -> bool
    where
        T: Serialize + Send + Sync;

    async fn delete_multiple(&self, keys: &[&str]) -> bool;

    /// Existence check, staged state first.
    async fn has(&self, key: &str) -> bool;

    /// Store only if absent. Goes straight to the backend; a staged write or
    /// delete for the key counts as "known" and refuses the add.
    async fn add<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync;

    /// Atomic add on a numeric value, bypassing the buffer. `None` when the
    /// backend fails or the value is not numeric.
    async fn increase(&self, key: &str, step: i64) -> Option<i64>;

    async fn decrease(&self, key: &str, step: i64) -> Option<i64>;

    /// Flush staged writes and deletes to the backend.
    async fn commit(&self);

    /// Discard staged writes, deletes, the read cache and the CAS ledger.
    async fn rollback(&self);

    /// End-of-request reset: discard all local state without writing.
    async fn cleanup(&self);
}
