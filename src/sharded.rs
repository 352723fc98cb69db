//! Sharded client
//!
//! Spreads keys over a cluster of independent nodes through the consistent
//! hash ring. Writes are immediate (no transaction buffer: a deferred write
//! cannot survive the ring reshaping underneath it), while CAS sessions keep
//! their tokens in a per-client ledger exactly like the single-node client.
//! A node whose connection cannot be established is evicted from the ring
//! and its keyspace share falls to the survivors; when the last node goes,
//! the client degrades to a disabled no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{Backend, CasToken, Connector, Expiry};
use crate::cas::CasLedger;
use crate::client::{CacheClient, WriteEntry};
use crate::codec::ValueCodec;
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::hook::{ObservabilityHook, OpRecord, TracingHook};
use crate::node::Node;
use crate::ring::{HashRing, KeyGroup};

fn routed_keys_of(group: &KeyGroup) -> Vec<String> {
    group.keys.iter().map(|(_, routed)| routed.clone()).collect()
}

pub struct ShardedCacheClient {
    ring: parking_lot::RwLock<HashRing>,
    connector: Arc<dyn Connector>,
    codec: ValueCodec,
    ledger: parking_lot::Mutex<CasLedger>,
    key_prefix: Option<String>,
    default_ttl: u64,
    disabled: AtomicBool,
    hook: Arc<dyn ObservabilityHook>,
}

impl ShardedCacheClient {
    pub fn new(config: CacheConfig, connector: Arc<dyn Connector>) -> Result<Self, CacheError> {
        config.require_servers()?;
        let mut ring = HashRing::new(config.slot_size);
        for addr in config.servers {
            ring.add_node(Arc::new(Node::new(addr)));
        }
        Ok(ShardedCacheClient {
            ring: parking_lot::RwLock::new(ring),
            connector,
            codec: ValueCodec::default(),
            ledger: parking_lot::Mutex::new(CasLedger::new()),
            key_prefix: config.key_prefix,
            default_ttl: config.default_ttl,
            disabled: AtomicBool::new(false),
            hook: Arc::new(TracingHook),
        })
    }

    pub fn with_hook(mut self, hook: Arc<dyn ObservabilityHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Whether the ring has run out of nodes. Terminal.
    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

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
            client: "sharded",
            action,
            keys,
            success,
            elapsed: started.elapsed(),
        });
    }

    fn mark_disabled(&self) {
        if !self.disabled.swap(true, Ordering::SeqCst) {
            tracing::error!("no cache nodes remain, sharded client disabled");
        }
    }

    fn evict(&self, node: &Node) {
        tracing::warn!(node = %node.addr(), "evicting unreachable cache node");
        self.ring.write().remove_node(node);
    }

    /// Resolve the owning node and its connection, evicting dead nodes until
    /// one answers or the ring is empty.
    async fn backend_for(&self, routed: &str) -> Option<Arc<dyn Backend>> {
        loop {
            if self.is_disabled() {
                return None;
            }
            let node = { self.ring.read().route(routed) };
            let Some(node) = node else {
                self.mark_disabled();
                return None;
            };
            match node.backend(self.connector.as_ref()).await {
                Ok(backend) => return Some(backend),
                Err(_) => self.evict(&node),
            }
        }
    }

    /// Group `(caller_key, routed_key)` pairs by owning node, with connections
    /// already established. Groups that land on a dead node are re-grouped
    /// against the shrunken ring.
    async fn connected_groups(
        &self,
        pairs: Vec<(String, String)>,
    ) -> Vec<(KeyGroup, Arc<dyn Backend>)> {
        let mut remaining = pairs;
        let mut ready = Vec::new();
        while !remaining.is_empty() && !self.is_disabled() {
            let groups = { self.ring.read().group_keys(&remaining) };
            let Some(groups) = groups else {
                self.mark_disabled();
                break;
            };
            remaining = Vec::new();
            for group in groups {
                match group.node.backend(self.connector.as_ref()).await {
                    Ok(backend) => ready.push((group, backend)),
                    Err(_) => {
                        self.evict(&group.node);
                        remaining.extend(group.keys);
                    }
                }
            }
        }
        ready
    }
}

#[async_trait]
impl CacheClient for ShardedCacheClient {
    async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        let started = Instant::now();
        let routed = self.make_key(key);
        let value = match self.backend_for(&routed).await {
            Some(backend) => match backend.get(&routed).await {
                Ok(Some(bytes)) => self.codec.decode(&bytes).ok(),
                _ => None,
            },
            None => None,
        };
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
        let token = { self.ledger.lock().take(&routed) };

        let ok = match self.backend_for(&routed).await {
            Some(backend) => match token {
                // An open CAS session turns the plain set into a
                // conditioned write.
                Some(token) => backend
                    .compare_and_swap(&token, &routed, &bytes, expiry)
                    .await
                    .unwrap_or(false),
                None => backend.set(&routed, &bytes, expiry).await.is_ok(),
            },
            None => false,
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
        let value = match self.backend_for(&routed).await {
            Some(backend) => match backend.get_with_token(&routed).await {
                Ok(Some((bytes, token))) => {
                    self.ledger.lock().record(&routed, token);
                    self.codec.decode(&bytes).ok()
                }
                Ok(None) => {
                    self.ledger.lock().invalidate(&routed);
                    None
                }
                Err(_) => None,
            },
            None => None,
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
                self.observe("cas_set", key, false, started);
                return false;
            }
        };
        let Ok(bytes) = self.codec.encode(value) else {
            self.observe("cas_set", key, false, started);
            return false;
        };
        let ok = match self.backend_for(&routed).await {
            Some(backend) => backend
                .compare_and_swap(&token, &routed, &bytes, self.expiry(ttl))
                .await
                .unwrap_or(false),
            None => false,
        };
        self.observe("cas_set", key, ok, started);
        ok
    }

    async fn delete(&self, key: &str) -> bool {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.ledger.lock().invalidate(&routed);
        let ok = match self.backend_for(&routed).await {
            Some(backend) => backend.delete(&routed).await.is_ok(),
            None => false,
        };
        self.observe("delete", key, ok, started);
        ok
    }

    /// Flushes every node still on the ring. True only when all answered.
    async fn clear(&self) -> bool {
        let started = Instant::now();
        self.ledger.lock().clear();
        let nodes = { self.ring.read().nodes() };
        if nodes.is_empty() {
            self.observe("clear", "*", false, started);
            return false;
        }
        let mut ok = true;
        for node in nodes {
            match node.backend(self.connector.as_ref()).await {
                Ok(backend) => ok &= backend.flush().await.is_ok(),
                Err(_) => {
                    self.evict(&node);
                    ok = false;
                }
            }
        }
        self.observe("clear", "*", ok, started);
        ok
    }

    async fn get_multiple<T>(&self, keys: &[&str]) -> HashMap<String, T>
    where
        T: DeserializeOwned + Send,
    {
        let started = Instant::now();
        let pairs: Vec<(String, String)> = keys
            .iter()
            .map(|key| (key.to_string(), self.make_key(key)))
            .collect();

        let mut found = HashMap::new();
        let mut ok = true;
        for (group, backend) in self.connected_groups(pairs).await {
            match backend.multi_get(&routed_keys_of(&group)).await {
                Ok(mut fetched) => {
                    for (caller_key, routed) in group.keys {
                        if let Some(bytes) = fetched.remove(&routed) {
                            if let Ok(value) = self.codec.decode(&bytes) {
                                found.insert(caller_key, value);
                            }
                        }
                    }
                }
                // A node that answered connect but failed the fetch costs
                // its share of the result, not the whole batch.
                Err(_) => ok = false,
            }
        }
        if self.is_disabled() {
            ok = false;
        }
        self.observe("get_multiple", &keys.join(","), ok, started);
        found
    }

    async fn set_multiple<T>(&self, entries: Vec<WriteEntry<T>>, ttl: Option<u64>) -> bool
    where
        T: Serialize + Send + Sync,
    {
        let started = Instant::now();
        let keys: Vec<String> = entries.iter().map(|e| e.key.clone()).collect();

        // Encode up front; an unencodable entry fails the batch result but
        // does not block the others.
        let mut ok = true;
        let mut encoded: HashMap<String, (Vec<u8>, Expiry)> = HashMap::new();
        let mut pairs = Vec::new();
        for entry in &entries {
            match self.codec.encode(&entry.value) {
                Ok(bytes) => {
                    let routed = self.make_key(&entry.key);
                    let expiry = self.expiry(entry.ttl.or(ttl));
                    self.ledger.lock().invalidate(&routed);
                    encoded.insert(routed.clone(), (bytes, expiry));
                    pairs.push((entry.key.clone(), routed));
                }
                Err(_) => ok = false,
            }
        }

        for (group, backend) in self.connected_groups(pairs).await {
            // One backend batch per expiry within the node's share.
            let mut by_expiry: HashMap<Expiry, Vec<(String, Vec<u8>)>> = HashMap::new();
            for (_, routed) in group.keys {
                if let Some((bytes, expiry)) = encoded.get(&routed) {
                    by_expiry
                        .entry(*expiry)
                        .or_default()
                        .push((routed, bytes.clone()));
                }
            }
            for (expiry, batch) in by_expiry {
                ok &= backend.multi_set(&batch, expiry).await.is_ok();
            }
        }
        if self.is_disabled() {
            ok = false;
        }
        self.observe("set_multiple", &keys.join(","), ok, started);
        ok
    }

    async fn delete_multiple(&self, keys: &[&str]) -> bool {
        let started = Instant::now();
        let pairs: Vec<(String, String)> = keys
            .iter()
            .map(|key| {
                let routed = self.make_key(key);
                self.ledger.lock().invalidate(&routed);
                (key.to_string(), routed)
            })
            .collect();

        let mut ok = true;
        for (group, backend) in self.connected_groups(pairs).await {
            let routed_keys: Vec<String> =
                group.keys.into_iter().map(|(_, routed)| routed).collect();
            ok &= backend.multi_delete(&routed_keys).await.is_ok();
        }
        if self.is_disabled() {
            ok = false;
        }
        self.observe("delete_multiple", &keys.join(","), ok, started);
        ok
    }

    async fn has(&self, key: &str) -> bool {
        let started = Instant::now();
        let routed = self.make_key(key);
        let present = match self.backend_for(&routed).await {
            Some(backend) => backend.exists(&routed).await.unwrap_or(false),
            None => false,
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
        let Ok(bytes) = self.codec.encode(value) else {
            self.observe("add", key, false, started);
            return false;
        };
        let ok = match self.backend_for(&routed).await {
            Some(backend) => backend
                .add(&routed, &bytes, self.expiry(ttl))
                .await
                .unwrap_or(false),
            None => false,
        };
        if ok {
            self.ledger.lock().invalidate(&routed);
        }
        self.observe("add", key, ok, started);
        ok
    }

    async fn increase(&self, key: &str, step: i64) -> Option<i64> {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.ledger.lock().invalidate(&routed);
        let result = match self.backend_for(&routed).await {
            Some(backend) => backend.increment(&routed, step).await.ok(),
            None => None,
        };
        self.observe("increase", key, result.is_some(), started);
        result
    }

    async fn decrease(&self, key: &str, step: i64) -> Option<i64> {
        let started = Instant::now();
        let routed = self.make_key(key);
        self.ledger.lock().invalidate(&routed);
        let result = match self.backend_for(&routed).await {
            Some(backend) => backend.decrement(&routed, step).await.ok(),
            None => None,
        };
        self.observe("decrease", key, result.is_some(), started);
        result
    }

    /// Writes are immediate in sharded mode; nothing is buffered.
    async fn commit(&self) {}

    async fn rollback(&self) {
        self.ledger.lock().clear();
    }

    async fn cleanup(&self) {
        self.ledger.lock().clear();
    }
}
