//! Client construction
//!
//! One place that knows how to pair a topology (single node or sharded)
//! with a transport (Redis or in-process memory). Applications hold a
//! [`CacheHandle`] and stay oblivious to which combination they got.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::CasToken;
use crate::client::{CacheClient, WriteEntry};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::memory::{MemoryBackend, MemoryConnector};
use crate::redis::{RedisBackend, RedisConnector};
use crate::sharded::ShardedCacheClient;
use crate::single::SingleNodeCacheClient;

pub struct CacheFactory;

impl CacheFactory {
    /// One Redis endpoint behind the retry-then-disable supervisor.
    pub fn single_redis(config: CacheConfig) -> Result<CacheHandle, CacheError> {
        let backend = Arc::new(RedisBackend::new(config.connect_timeout));
        Ok(CacheHandle::Single(SingleNodeCacheClient::new(
            config, backend,
        )?))
    }

    /// A Redis cluster spread over the consistent hash ring.
    pub fn sharded_redis(config: CacheConfig) -> Result<CacheHandle, CacheError> {
        let connector = Arc::new(RedisConnector::new(config.connect_timeout));
        Ok(CacheHandle::Sharded(ShardedCacheClient::new(
            config, connector,
        )?))
    }

    /// In-process store with the full client surface. Useful for tests and
    /// for running without cache infrastructure.
    pub fn single_memory(config: CacheConfig) -> Result<CacheHandle, CacheError> {
        let backend = Arc::new(MemoryBackend::new());
        Ok(CacheHandle::Single(SingleNodeCacheClient::new(
            config, backend,
        )?))
    }

    pub fn sharded_memory(config: CacheConfig) -> Result<CacheHandle, CacheError> {
        let connector = Arc::new(MemoryConnector::new());
        Ok(CacheHandle::Sharded(ShardedCacheClient::new(
            config, connector,
        )?))
    }
}

/// A constructed client of either topology.
pub enum CacheHandle {
    Single(SingleNodeCacheClient),
    Sharded(ShardedCacheClient),
}

macro_rules! delegate {
    ($self:ident . $method:ident ( $($arg:expr),* )) => {
        match $self {
            CacheHandle::Single(client) => client.$method($($arg),*).await,
            CacheHandle::Sharded(client) => client.$method($($arg),*).await,
        }
    };
}

#[async_trait]
impl CacheClient for CacheHandle {
    async fn get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        delegate!(self.get(key))
    }

    async fn set<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync,
    {
        delegate!(self.set(key, value, ttl))
    }

    async fn cas_get<T>(&self, key: &str) -> Option<T>
    where
        T: DeserializeOwned + Send,
    {
        delegate!(self.cas_get(key))
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
        delegate!(self.cas_set(key, value, ttl, token))
    }

    async fn delete(&self, key: &str) -> bool {
        delegate!(self.delete(key))
    }

    async fn clear(&self) -> bool {
        delegate!(self.clear())
    }

    async fn get_multiple<T>(&self, keys: &[&str]) -> HashMap<String, T>
    where
        T: DeserializeOwned + Send,
    {
        delegate!(self.get_multiple(keys))
    }

    async fn set_multiple<T>(&self, entries: Vec<WriteEntry<T>>, ttl: Option<u64>) -> bool
    where
        T: Serialize + Send + Sync,
    {
        delegate!(self.set_multiple(entries, ttl))
    }

    async fn delete_multiple(&self, keys: &[&str]) -> bool {
        delegate!(self.delete_multiple(keys))
    }

    async fn has(&self, key: &str) -> bool {
        delegate!(self.has(key))
    }

    async fn add<T>(&self, key: &str, value: &T, ttl: Option<u64>) -> bool
    where
        T: Serialize + Sync,
    {
        delegate!(self.add(key, value, ttl))
    }

    async fn increase(&self, key: &str, step: i64) -> Option<i64> {
        delegate!(self.increase(key, step))
    }

    async fn decrease(&self, key: &str, step: i64) -> Option<i64> {
        delegate!(self.decrease(key, step))
    }

    async fn commit(&self) {
        delegate!(self.commit())
    }

    async fn rollback(&self) {
        delegate!(self.rollback())
    }

    async fn cleanup(&self) {
        delegate!(self.cleanup())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn factory_rejects_configs_without_servers() {
        assert!(matches!(
            CacheFactory::single_memory(CacheConfig::default()),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            CacheFactory::sharded_memory(CacheConfig::default()),
            Err(CacheError::Config(_))
        ));
    }

    #[tokio::test]
    async fn handle_delegates_to_the_underlying_client() {
        let config = CacheConfig::from_endpoints(&["local:0"]).unwrap();
        let cache = CacheFactory::single_memory(config).unwrap();

        assert!(cache.set("k", &42_i64, None).await);
        assert_eq!(cache.get::<i64>("k").await, Some(42));
        cache.commit().await;
        assert!(cache.has("k").await);
        assert!(cache.delete("k").await);
        cache.commit().await;
        assert_eq!(cache.get::<i64>("k").await, None);
    }

    #[tokio::test]
    async fn sharded_memory_handle_round_trips() {
        let config = CacheConfig::from_endpoints(&["a:1", "b:2", "c:3"]).unwrap();
        let cache = CacheFactory::sharded_memory(config).unwrap();

        for i in 0..20 {
            assert!(cache.set(&format!("k{i}"), &i, None).await);
        }
        for i in 0..20 {
            assert_eq!(cache.get::<i32>(&format!("k{i}")).await, Some(i));
        }
    }
}
