//! Retry-then-disable connection supervision
//!
//! A [`RetryableClient`] wraps one [`Backend`] and supervises its link. The
//! first failed operation that looks like a dead connection triggers exactly
//! one reconnect-and-replay cycle; a second consecutive failure degrades the
//! client permanently. Once disabled, every call short-circuits without any
//! network attempt, so one dead cache endpoint cannot stall the application
//! on every request.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use crate::backend::{Backend, BackendError, CasToken, Expiry};
use crate::config::ServerAddr;

/// Connection lifecycle. `Disabled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Uninitialized,
    Connected,
    Reconnecting,
    Disabled,
}

pub struct RetryableClient {
    backend: Arc<dyn Backend>,
    servers: Vec<ServerAddr>,
    state: tokio::sync::Mutex<LinkState>,
}

impl RetryableClient {
    pub fn new(backend: Arc<dyn Backend>, servers: Vec<ServerAddr>) -> Self {
        RetryableClient {
            backend,
            servers,
            state: tokio::sync::Mutex::new(LinkState::Uninitialized),
        }
    }

    pub async fn link_state(&self) -> LinkState {
        *self.state.lock().await
    }

    /// First-use connection. Seeds the server list and connects; a failure
    /// here disables the client outright.
    async fn ensure_connected(&self) -> Result<(), BackendError> {
        let mut state = self.state.lock().await;
        match *state {
            LinkState::Disabled => Err(BackendError::disabled()),
            LinkState::Uninitialized => {
                for addr in &self.servers {
                    self.backend.add_server(addr.clone());
                }
                match self.backend.connect().await {
                    Ok(()) => {
                        *state = LinkState::Connected;
                        Ok(())
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "initial cache connect failed, disabling");
                        *state = LinkState::Disabled;
                        Err(err)
                    }
                }
            }
            LinkState::Connected | LinkState::Reconnecting => Ok(()),
        }
    }

    /// Rebuild the connection from scratch: clear the server list, re-add the
    /// configured endpoints, connect.
    async fn reconnect(&self) -> Result<(), BackendError> {
        self.backend.reset_server_list();
        for addr in &self.servers {
            self.backend.add_server(addr.clone());
        }
        self.backend.connect().await
    }

    /// Run one operation under the retry policy.
    async fn run<T, F, Fut>(&self, op: F) -> Result<T, BackendError>
    where
        F: Fn(Arc<dyn Backend>) -> Fut,
        Fut: Future<Output = Result<T, BackendError>>,
    {
        self.ensure_connected().await?;

        let err = match op(Arc::clone(&self.backend)).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_unreachable() => err,
            Err(err) => return Err(err),
        };

        // One reconnect-and-replay cycle, serialized across callers. Whoever
        // loses the lock race sees the state the winner left behind.
        let mut state = self.state.lock().await;
        if *state == LinkState::Disabled {
            return Err(BackendError::disabled());
        }
        *state = LinkState::Reconnecting;
        tracing::warn!(error = %err, "cache link lost, reconnecting");

        if let Err(err) = self.reconnect().await {
            tracing::error!(error = %err, "reconnect failed, disabling cache client");
            *state = LinkState::Disabled;
            return Err(err);
        }

        match op(Arc::clone(&self.backend)).await {
            Ok(value) => {
                *state = LinkState::Connected;
                Ok(value)
            }
            Err(err) if err.is_unreachable() => {
                tracing::error!(error = %err, "replay after reconnect failed, disabling");
                *state = LinkState::Disabled;
                Err(err)
            }
            Err(err) => {
                // The link came back; the operation itself is at fault.
                *state = LinkState::Connected;
                Err(err)
            }
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        self.run(|b| async move { b.get(key).await }).await
    }

    pub async fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), BackendError> {
        self.run(|b| async move { b.set(key, value, expiry).await })
            .await
    }

    pub async fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, BackendError> {
        self.run(|b| async move { b.add(key, value, expiry).await })
            .await
    }

    pub async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        self.run(|b| async move { b.delete(key).await }).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        self.run(|b| async move { b.exists(key).await }).await
    }

    pub async fn increment(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        self.run(|b| async move { b.increment(key, step).await })
            .await
    }

    pub async fn decrement(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        self.run(|b| async move { b.decrement(key, step).await })
            .await
    }

    pub async fn get_with_token(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, CasToken)>, BackendError> {
        self.run(|b| async move { b.get_with_token(key).await })
            .await
    }

    pub async fn compare_and_swap(
        &self,
        token: &CasToken,
        key: &str,
        value: &[u8],
        expiry: Expiry,
    ) -> Result<bool, BackendError> {
        self.run(|b| async move { b.compare_and_swap(token, key, value, expiry).await })
            .await
    }

    pub async fn multi_get(
        &self,
        keys: &[String],
    ) -> Result<HashMap<String, Vec<u8>>, BackendError> {
        self.run(|b| async move { b.multi_get(keys).await }).await
    }

    pub async fn multi_set(
        &self,
        entries: &[(String, Vec<u8>)],
        expiry: Expiry,
    ) -> Result<(), BackendError> {
        self.run(|b| async move { b.multi_set(entries, expiry).await })
            .await
    }

    pub async fn multi_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        self.run(|b| async move { b.multi_delete(keys).await })
            .await
    }

    pub async fn flush(&self) -> Result<(), BackendError> {
        self.run(|b| async move { b.flush().await }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::ErrorKind;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted backend: fails the next N gets (and optionally connects) with
    /// `Unreachable`, and counts every call.
    #[derive(Default)]
    struct FlakyBackend {
        entries: Mutex<HashMap<String, Vec<u8>>>,
        servers: Mutex<Vec<ServerAddr>>,
        fail_next_gets: AtomicUsize,
        fail_next_connects: AtomicUsize,
        connects: AtomicUsize,
        gets: AtomicUsize,
    }

    impl FlakyBackend {
        fn take_failure(counter: &AtomicUsize) -> bool {
            counter
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        }
    }

    #[async_trait]
    impl Backend for FlakyBackend {
        async fn connect(&self) -> Result<(), BackendError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.fail_next_connects) {
                return Err(BackendError::unreachable("connect refused"));
            }
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            self.gets.fetch_add(1, Ordering::SeqCst);
            if Self::take_failure(&self.fail_next_gets) {
                return Err(BackendError::unreachable("connection dropped"));
            }
            Ok(self.entries.lock().get(key).cloned())
        }

        async fn set(&self, key: &str, value: &[u8], _expiry: Expiry) -> Result<(), BackendError> {
            self.entries.lock().insert(key.to_string(), value.to_vec());
            Ok(())
        }

        async fn add(
            &self,
            _key: &str,
            _value: &[u8],
            _expiry: Expiry,
        ) -> Result<bool, BackendError> {
            Ok(false)
        }

        async fn delete(&self, key: &str) -> Result<bool, BackendError> {
            Ok(self.entries.lock().remove(key).is_some())
        }

        async fn exists(&self, key: &str) -> Result<bool, BackendError> {
            Ok(self.entries.lock().contains_key(key))
        }

        async fn increment(&self, _key: &str, _step: i64) -> Result<i64, BackendError> {
            Err(BackendError::not_numeric("unsupported in this test"))
        }

        async fn decrement(&self, _key: &str, _step: i64) -> Result<i64, BackendError> {
            Err(BackendError::not_numeric("unsupported in this test"))
        }

        async fn get_with_token(
            &self,
            _key: &str,
        ) -> Result<Option<(Vec<u8>, CasToken)>, BackendError> {
            Ok(None)
        }

        async fn compare_and_swap(
            &self,
            _token: &CasToken,
            _key: &str,
            _value: &[u8],
            _expiry: Expiry,
        ) -> Result<bool, BackendError> {
            Ok(false)
        }

        async fn multi_get(
            &self,
            keys: &[String],
        ) -> Result<HashMap<String, Vec<u8>>, BackendError> {
            let entries = self.entries.lock();
            Ok(keys
                .iter()
                .filter_map(|k| entries.get(k).map(|v| (k.clone(), v.clone())))
                .collect())
        }

        async fn multi_set(
            &self,
            entries: &[(String, Vec<u8>)],
            _expiry: Expiry,
        ) -> Result<(), BackendError> {
            let mut store = self.entries.lock();
            for (key, value) in entries {
                store.insert(key.clone(), value.clone());
            }
            Ok(())
        }

        async fn multi_delete(&self, keys: &[String]) -> Result<(), BackendError> {
            let mut store = self.entries.lock();
            for key in keys {
                store.remove(key);
            }
            Ok(())
        }

        async fn flush(&self) -> Result<(), BackendError> {
            self.entries.lock().clear();
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

    fn client_over(backend: Arc<FlakyBackend>) -> RetryableClient {
        RetryableClient::new(backend, vec![ServerAddr::new("cache-1", 6379)])
    }

    #[tokio::test]
    async fn connects_lazily_on_first_use() {
        let backend = Arc::new(FlakyBackend::default());
        let client = client_over(Arc::clone(&backend));
        assert_eq!(client.link_state().await, LinkState::Uninitialized);

        client.set("k", b"v", Expiry::Forever).await.unwrap();
        assert_eq!(client.link_state().await, LinkState::Connected);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);

        // Later calls reuse the established link.
        client.get("k").await.unwrap();
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn one_dropped_call_is_replayed_after_reconnect() {
        let backend = Arc::new(FlakyBackend::default());
        backend
            .entries
            .lock()
            .insert("k".to_string(), b"v".to_vec());
        backend.fail_next_gets.store(1, Ordering::SeqCst);
        let client = client_over(Arc::clone(&backend));

        let value = client.get("k").await.unwrap();
        assert_eq!(value.as_deref(), Some(&b"v"[..]));
        assert_eq!(client.link_state().await, LinkState::Connected);
        // Initial connect plus the reconnect.
        assert_eq!(backend.connects.load(Ordering::SeqCst), 2);
        assert_eq!(backend.gets.load(Ordering::SeqCst), 2);
        // Reconnect rebuilt the server list rather than appending.
        assert_eq!(backend.server_list().len(), 1);
    }

    #[tokio::test]
    async fn second_consecutive_failure_disables() {
        let backend = Arc::new(FlakyBackend::default());
        backend.fail_next_gets.store(2, Ordering::SeqCst);
        let client = client_over(Arc::clone(&backend));

        let err = client.get("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unreachable);
        assert_eq!(client.link_state().await, LinkState::Disabled);

        // Disabled short-circuits: no further backend traffic.
        let gets_before = backend.gets.load(Ordering::SeqCst);
        let err = client.get("k").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Disabled);
        assert_eq!(backend.gets.load(Ordering::SeqCst), gets_before);
    }

    #[tokio::test]
    async fn failed_reconnect_disables() {
        let backend = Arc::new(FlakyBackend::default());
        let client = client_over(Arc::clone(&backend));

        // Establish the link first, then script a dropped call whose
        // reconnect attempt is refused.
        client.exists("k").await.unwrap();
        backend.fail_next_gets.store(1, Ordering::SeqCst);
        backend.fail_next_connects.store(1, Ordering::SeqCst);

        assert!(client.get("k").await.is_err());
        assert_eq!(client.link_state().await, LinkState::Disabled);
    }

    #[tokio::test]
    async fn initial_connect_failure_disables() {
        let backend = Arc::new(FlakyBackend::default());
        backend.fail_next_connects.store(1, Ordering::SeqCst);
        let client = client_over(Arc::clone(&backend));

        assert!(client.get("k").await.is_err());
        assert_eq!(client.link_state().await, LinkState::Disabled);
    }

    #[tokio::test]
    async fn non_link_errors_do_not_trigger_reconnect() {
        let backend = Arc::new(FlakyBackend::default());
        let client = client_over(Arc::clone(&backend));

        let err = client.increment("k", 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotNumeric);
        assert_eq!(client.link_state().await, LinkState::Connected);
        assert_eq!(backend.connects.load(Ordering::SeqCst), 1);
    }
}
