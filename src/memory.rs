//! In-process backend
//!
//! A [`MemoryBackend`] keeps entries in a [`DashMap`] with lazy expiry:
//! entries past their deadline are purged when a read or write touches them.
//! Every entry carries a version counter, which is what CAS tokens compare
//! against. Useful on its own as an embedded cache and as the backend under
//! the test suites of the client layers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::backend::{Backend, BackendError, CasToken, Connector, Expiry};
use crate::config::ServerAddr;

#[derive(Debug, Clone)]
struct StoredEntry {
    data: Vec<u8>,
    version: u64,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

fn deadline(expiry: Expiry) -> Option<Instant> {
    expiry
        .as_secs()
        .map(|secs| Instant::now() + Duration::from_secs(secs))
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: DashMap<String, StoredEntry>,
    versions: AtomicU64,
    servers: parking_lot::Mutex<Vec<ServerAddr>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> u64 {
        self.versions.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Read the live entry, purging it if expired. The snapshot is cloned
    /// before the purge so no shard guard is held across `remove_if`.
    fn live(&self, key: &str) -> Option<StoredEntry> {
        let now = Instant::now();
        let snapshot = self.entries.get(key).map(|entry| entry.value().clone());
        match snapshot {
            Some(entry) if !entry.is_expired(now) => Some(entry),
            Some(_) => {
                self.entries
                    .remove_if(key, |_, entry| entry.is_expired(now));
                None
            }
            None => None,
        }
    }

    fn store(&self, key: &str, value: &[u8], expiry: Expiry) {
        self.entries.insert(
            key.to_string(),
            StoredEntry {
                data: value.to_vec(),
                version: self.next_version(),
                expires_at: deadline(expiry),
            },
        );
    }

    fn parse_number(entry: &StoredEntry) -> Result<i64, BackendError> {
        std::str::from_utf8(&entry.data)
            .ok()
            .and_then(|text| text.trim().parse::<i64>().ok())
            .ok_or_else(|| BackendError::not_numeric("value is not an integer"))
    }

    fn apply_step(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        // entry() holds the shard lock, making the read-modify-write atomic.
        let mut slot = self.entries.entry(key.to_string()).or_insert_with(|| StoredEntry {
            data: b"0".to_vec(),
            version: self.next_version(),
            expires_at: None,
        });
        if slot.is_expired(Instant::now()) {
            slot.data = b"0".to_vec();
            slot.expires_at = None;
        }
        let next = Self::parse_number(&slot)?.saturating_add(step);
        slot.data = next.to_string().into_bytes();
        slot.version = self.next_version();
        Ok(next)
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.live(key).map(|entry| entry.data))
    }

    async fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), BackendError> {
        self.store(key, value, expiry);
        Ok(())
    }

    async fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, BackendError> {
        if self.live(key).is_some() {
            return Ok(false);
        }
        self.store(key, value, expiry);
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let existed = self.live(key).is_some();
        self.entries.remove(key);
        Ok(existed)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.live(key).is_some())
    }

    async fn increment(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        self.apply_step(key, step)
    }

    async fn decrement(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        self.apply_step(key, -step)
    }

    async fn get_with_token(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, CasToken)>, BackendError> {
        Ok(self
            .live(key)
            .map(|entry| (entry.data, CasToken::new(entry.version.to_be_bytes().to_vec()))))
    }

    async fn compare_and_swap(
        &self,
        token: &CasToken,
        key: &str,
        value: &[u8],
        expiry: Expiry,
    ) -> Result<bool, BackendError> {
        let now = Instant::now();
        let version = self.next_version();
        let mut swapped = false;
        // Entry-level lock keeps compare and write atomic.
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired(now) && entry.version.to_be_bytes() == token.as_bytes() {
                entry.data = value.to_vec();
                entry.version = version;
                entry.expires_at = deadline(expiry);
                swapped = true;
            }
        }
        Ok(swapped)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, BackendError> {
        Ok(keys
            .iter()
            .filter_map(|key| self.live(key).map(|entry| (key.clone(), entry.data)))
            .collect())
    }

    async fn multi_set(
        &self,
        entries: &[(String, Vec<u8>)],
        expiry: Expiry,
    ) -> Result<(), BackendError> {
        for (key, value) in entries {
            self.store(key, value, expiry);
        }
        Ok(())
    }

    async fn multi_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        for key in keys {
            self.entries.remove(key);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), BackendError> {
        self.entries.clear();
        Ok(())
    }

    fn server_list(&self) -> Vec<ServerAddr> {
        self.servers.lock().clone()
    }

    fn reset_server_list(&self) {
        self.servers.lock().clear();
    }

    fn add_server(&self, addr: ServerAddr) {
        self.servers.lock().push(addr);
    }
}

/// Hands out one shared [`MemoryBackend`] per address, so two clients built
/// against the same endpoint see the same data. Addresses can be marked dead
/// to exercise eviction and reconnect paths.
#[derive(Default)]
pub struct MemoryConnector {
    stores: DashMap<ServerAddr, Arc<MemoryBackend>>,
    dead: DashMap<ServerAddr, ()>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make connections to `addr` fail from now on.
    pub fn kill(&self, addr: &ServerAddr) {
        self.dead.insert(addr.clone(), ());
    }

    /// The backend bound to `addr`, creating it on first use.
    pub fn store(&self, addr: &ServerAddr) -> Arc<MemoryBackend> {
        self.stores
            .entry(addr.clone())
            .or_insert_with(|| Arc::new(MemoryBackend::new()))
            .clone()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, addr: &ServerAddr) -> Result<Arc<dyn Backend>, BackendError> {
        if self.dead.contains_key(addr) {
            return Err(BackendError::unreachable(format!("{addr} is down")));
        }
        Ok(self.store(addr) as Arc<dyn Backend>)
    }
}
