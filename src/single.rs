//! Single-node client
//!
//! Binds the full client surface to one supervised backend connection:
//! values go through the [`ValueCodec`], writes stage into the
//! [`TransactionBuffer`] until commit, CAS tokens ride the [`CasLedger`],
//! and the link itself is watched by the retry-then-disable policy in
//! [`RetryableClient`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{Backend, CasToken, Expiry};
use crate::cas::CasLedger;
use crate::client::{CacheClient, WriteEntry};
use crate::codec::ValueCodec;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::hook::{ObservabilityHook, OpRecord, TracingHook};
use crate::retry::{LinkState, RetryableClient};
use crate::txn::{Resolution, StagedOp, TransactionBuffer};

pub struct SingleNodeCacheClient {
    conn: RetryableClient,
    codec: ValueCodec,
    ledger: parking_lot::Mutex<CasLedger>,
    buffer: parking_lot::Mutex<TransactionBuffer>,
    key_prefix: Option<String>,
    default_ttl: u64,
    hook: Arc<dyn ObservabilityHook>,
}

impl SingleNodeCacheClient {
    /// Misconfiguration (an empty server list) is the one fatal error; every
    /// later failure degrades to misses and refused writes.
    pub fn new(config: CacheConfig, backend: Arc<dyn Backend>) -> Result<Self, CacheError> {
        config.require_servers()?;
        Ok(SingleNodeCacheClient {
            conn: RetryableClient::new(backend, config.servers),
            codec: ValueCodec::default(),
            ledger: parking_lot::Mutex::new(CasLedger::new()),
            buffer: parking_lot::Mutex::new(TransactionBuffer::new()),
            key_prefix: config.key_prefix,
            default_ttl: config.default_ttl,
            hook: Arc::new(TracingHook),
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn ObservabilityHook>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn link_state(&self) -> LinkState {
        self.conn.link_state().await
    }

    /// Backend-visible key: `prefix.key` when a prefix is configured.
    fn make_key(&self, key: &str) -> String {
        match &self.key_prefix {
            Some(prefix) => format!("{prefix}.{key}"),
            None => key.to_string(),
        }
    }

    fn expiry(&self, ttl: Option<u64>) -> Expiry {
        Expiry::normalize(ttl, self.default_ttl)
    }

    fn observe(&self, action: &str, keys: &str, success: bool, started: Instant) {
        self.hook.record(&OpRecord {
            client: "single",
            action,
            keys,
            success,
            elapsed: started.elapsed(),
        });
    }

    /// Push one staged operation to the backend ahead of a CAS read, so the
    /// token reflects the state the caller last wrote.
    async fn flush_staged(&self, routed: &str) {
        let staged = { self.buffer.lock().take_staged(routed) };
        match staged {
            Some(StagedOp::Write(bytes, expiry)) => {
                if let Err(err) = self.conn.set(routed, &bytes, expiry).await {
                    tracing::warn!(key = routed, error = %err, "staged write flush failed");
                }
            }
            Some(StagedOp::Delete) => {
                if let Err(err) = self.conn.delete(routed).await {
                    tracing::warn!(key = routed, error = %err, "staged delete flush failed");
                }
            }
            None => {}
        }
    }
}

#[async_trait]
impl CacheClient for SingleNodeCacheClient {
    async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let started = Instant::now();
        let routed = self.make_key(key);
        let local = { self.buffer.lock().resolve(&routed) };
        let bytes = match local {
            Resolution::Value(bytes) => Some(bytes),
            Resolution::Deleted => None,
            Resolution::Unknown => match self.conn.get(&routed).await {
                Ok(Some(bytes)) => {
                    self.buffer.lock().note_read(&routed, bytes.clone());
                    Some(bytes)
                }
                Ok(None) => None,
                Err(_) => {
                    self.observe("get", key, false, started);
                    return None;
                }
            },
        };
        let value = bytes.and_then(|bytes| self.codec.decode(&bytes).ok());
        self.observe("get", key, value.is_some(), started);
        value
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync,
    {
        let started = Instant::now();
        let routed = self.make_key(key);
        let Ok(bytes) = self.codec.encode(value) else {
            self.observe("set", key, false, started);
            return false;
        };
        let expiry = self.expiry(ttl);

        // A token on ledger means the caller is in a CAS session for this
        // key; a plain set must not stomp a concurrent writer.
        let token = { self.ledger.lock().take(&routed) };
        let ok = match token {
            Some(token) => match self.conn.compare_and_swap(&token, &routed, &bytes, expiry).await {
                Ok(true) => {
                    self.buffer.lock().apply_write_through(&routed, bytes);
                    true
                }
                Ok(false) | Err(_) => false,
            },
            None => {
                self.buffer.lock().stage_set(&routed, bytes, expiry);
                true
            }
        };
        self.observe("set", key, ok, started);
        ok
    }

    async fn cas_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.flush_staged(&routed).await;

        let value = match self.conn.get_with_token(&routed).await {
            Ok(Some((bytes, token))) => {
                self.ledger.lock().record(&routed, token);
                self.buffer.lock().note_read(&routed, bytes.clone());
                self.codec.decode(&bytes).ok()
            }
            Ok(None) => {
                // Nothing to version; an earlier token for this key is stale.
                self.ledger.lock().invalidate(&routed);
                None
            }
            Err(_) => None,
        };
        self.observe("cas_get", key, value.is_some(), started);
        value
    }

    async fn cas_set<T>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<u64>,
        token: Option<CasToken>,
    ) -> bool
    where
        T: Serialize + Sync,
    {
        let started = Instant::now();
        let routed = self.make_key(key);
        let token = match token.or_else(|| self.ledger.lock().take(&routed)) {
            Some(token) => token,
            None => {
                // Blind conditioned write: refused locally, no backend call.
                self.observe("cas_set", key, false, started);
                return false;
            }
        };
        let Ok(bytes) = self.codec.encode(value) else {
            self.observe("cas_set", key, false, started);
            return false;
        };

        let ok = matches!(
            self.conn
                .compare_and_swap(&token, &routed, &bytes, self.expiry(ttl))
                .await,
            Ok(true)
        );
        if ok {
            self.buffer.lock().apply_write_through(&routed, bytes);
        }
        self.observe("cas_set", key, ok, started);
        ok
    }

    async fn delete(&self, key: &str) -> bool {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.ledger.lock().invalidate(&routed);
        self.buffer.lock().stage_delete(&routed);
        self.observe("delete", key, true, started);
        true
    }

    async fn clear(&self) -> bool {
        let started = Instant::now();
        self.buffer.lock().cleanup();
        self.ledger.lock().clear();
        let ok = self.conn.flush().await.is_ok();
        self.observe("clear", "*", ok, started);
        ok
    }

    async fn get_multiple<T>(&self, keys: &[&str]) -> HashMap<String, T>
    where
        T: DeserializeOwned + Send,
    {
        let started = Instant::now();
        let mut found: HashMap<String, T> = HashMap::new();
        let mut remote: Vec<(String, String)> = Vec::new();

        {
            let buffer = self.buffer.lock();
            for key in keys {
                let routed = self.make_key(key);
                match buffer.resolve(&routed) {
                    Resolution::Value(bytes) => {
                        if let Ok(value) = self.codec.decode(&bytes) {
                            found.insert(key.to_string(), value);
                        }
                    }
                    Resolution::Deleted => {}
                    Resolution::Unknown => remote.push((key.to_string(), routed)),
                }
            }
        }

        let mut ok = true;
        if !remote.is_empty() {
            let routed_keys: Vec<String> = remote.iter().map(|(_, r)| r.clone()).collect();
            match self.conn.multi_get(&routed_keys).await {
                Ok(mut fetched) => {
                    let mut buffer = self.buffer.lock();
                    for (caller_key, routed) in remote {
                        if let Some(bytes) = fetched.remove(&routed) {
                            buffer.note_read(&routed, bytes.clone());
                            if let Ok(value) = self.codec.decode(&bytes) {
                                found.insert(caller_key, value);
                            }
                        }
                    }
                }
                Err(_) => ok = false,
            }
        }

        self.observe("get_multiple", &keys.join(","), ok, started);
        found
    }

    async fn set_multiple<T>(&self, entries: Vec<WriteEntry<T>>, ttl: Option<u64>) -> bool
    where
        T: Serialize + Send + Sync,
    {
        let started = Instant::now();
        let mut ok = true;
        let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();
        {
            let mut buffer = self.buffer.lock();
            let mut ledger = self.ledger.lock();
            for entry in entries {
                let routed = self.make_key(&entry.key);
                match self.codec.encode(&entry.value) {
                    Ok(bytes) => {
                        // Per-entry TTL wins over the batch TTL.
                        let expiry = self.expiry(entry.ttl.or(ttl));
                        ledger.invalidate(&routed);
                        buffer.stage_set(&routed, bytes, expiry);
                    }
                    Err(_) => ok = false,
                }
            }
        }
        self.observe("set_multiple", &keys.join(","), ok, started);
        ok
    }

    async fn delete_multiple(&self, keys: &[&str]) -> bool {
        let started = Instant::now();
        {
            let mut buffer = self.buffer.lock();
            let mut ledger = self.ledger.lock();
            for key in keys {
                let routed = self.make_key(key);
                ledger.invalidate(&routed);
                buffer.stage_delete(&routed);
            }
        }
        self.observe("delete_multiple", &keys.join(","), true, started);
        true
    }

    async fn has(&self, key: &str) -> bool {
        let started = Instant::now();
        let routed = self.make_key(key);
        let local = { self.buffer.lock().resolve(&routed) };
        let present = match local {
            Resolution::Value(_) => true,
            Resolution::Deleted => false,
            Resolution::Unknown => self.conn.exists(&routed).await.unwrap_or(false),
        };
        self.observe("has", key, present, started);
        present
    }

    async fn add<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync,
    {
        let started = Instant::now();
        let routed = self.make_key(key);
        if self.buffer.lock().knows(&routed) {
            self.observe("add", key, false, started);
            return false;
        }
        let Ok(bytes) = self.codec.encode(value) else {
            self.observe("add", key, false, started);
            return false;
        };
        let ok = self
            .conn
            .add(&routed, &bytes, self.expiry(ttl))
            .await
            .unwrap_or(false);
        if ok {
            self.ledger.lock().invalidate(&routed);
            self.buffer.lock().note_read(&routed, bytes);
        }
        self.observe("add", key, ok, started);
        ok
    }

    async fn increase(&self, key: &str, step: i64) -> Option<i64> {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.ledger.lock().invalidate(&routed);
        self.buffer.lock().forget(&routed);
        let result = self.conn.increment(&routed, step).await.ok();
        self.observe("increase", key, result.is_some(), started);
        result
    }

    async fn decrease(&self, key: &str, step: i64) -> Option<i64> {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.ledger.lock().invalidate(&routed);
        self.buffer.lock().forget(&routed);
        let result = self.conn.decrement(&routed, step).await.ok();
        self.observe("decrease", key, result.is_some(), started);
        result
    }

    async fn commit(&self) {
        let started = Instant::now();
        let batch = { self.buffer.lock().take_pending() };
        if batch.is_empty() {
            return;
        }
        // TTL groups are independent; push them concurrently.
        let writes = batch
            .writes
            .iter()
            .map(|(expiry, entries)| self.conn.multi_set(entries, *expiry));
        let mut ok = futures::future::join_all(writes)
            .await
            .iter()
            .all(|result| result.is_ok());
        if !batch.deletes.is_empty() && self.conn.multi_delete(&batch.deletes).await.is_err() {
            ok = false;
        }
        self.observe("commit", "*", ok, started);
    }

    async fn rollback(&self) {
        self.buffer.lock().rollback();
        self.ledger.lock().clear();
    }

    async fn cleanup(&self) {
        self.buffer.lock().cleanup();
        self.ledger.lock().clear();
    }
}
