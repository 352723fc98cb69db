//! Redis backend
//!
//! Wraps a [`ConnectionManager`] with the [`Backend`] contract. Redis has no
//! native CAS token, so `get_with_token` snapshots the raw stored value and
//! `compare_and_swap` runs a Lua script that writes only if the stored value
//! still equals that snapshot. The script executes atomically on the server,
//! which is what makes the compare race-free.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::backend::{Backend, BackendError, CasToken, Connector, ErrorKind, Expiry};
use crate::config::ServerAddr;

const CAS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  if tonumber(ARGV[3]) > 0 then
    redis.call('SETEX', KEYS[1], ARGV[3], ARGV[2])
  else
    redis.call('SET', KEYS[1], ARGV[2])
  end
  return 1
end
return 0
"#;

impl From<redis::RedisError> for BackendError {
    fn from(err: redis::RedisError) -> Self {
        let kind = if err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_io_error()
            || err.is_timeout()
        {
            ErrorKind::Unreachable
        } else if err.kind() == redis::ErrorKind::TypeError {
            ErrorKind::NotNumeric
        } else {
            ErrorKind::Protocol
        };
        BackendError::new(kind, err.to_string())
    }
}

pub struct RedisBackend {
    servers: parking_lot::Mutex<Vec<ServerAddr>>,
    manager: tokio::sync::RwLock<Option<ConnectionManager>>,
    connect_timeout: Duration,
    cas_script: redis::Script,
}

impl RedisBackend {
    pub fn new(connect_timeout: Duration) -> Self {
        RedisBackend {
            servers: parking_lot::Mutex::new(Vec::new()),
            manager: tokio::sync::RwLock::new(None),
            connect_timeout,
            cas_script: redis::Script::new(CAS_SCRIPT),
        }
    }

    async fn conn(&self) -> Result<ConnectionManager, BackendError> {
        self.manager
            .read()
            .await
            .clone()
            .ok_or_else(|| BackendError::unreachable("not connected"))
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn connect(&self) -> Result<(), BackendError> {
        let addr = self
            .servers
            .lock()
            .first()
            .cloned()
            .ok_or_else(|| BackendError::unreachable("no server configured"))?;

        let client = redis::Client::open(format!("redis://{}:{}/", addr.host, addr.port))?;
        let manager = tokio::time::timeout(self.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                BackendError::unreachable(format!("connect to {addr} timed out"))
            })??;

        *self.manager.write().await = Some(manager);
        tracing::debug!(server = %addr, "redis connection established");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        let mut conn = self.conn().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        match expiry.as_secs() {
            Some(secs) => conn.set_ex::<_, _, ()>(key, value, secs).await?,
            None => conn.set::<_, _, ()>(key, value).await?,
        }
        Ok(())
    }

    async fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX");
        if let Some(secs) = expiry.as_secs() {
            cmd.arg("EX").arg(secs);
        }
        // SET NX answers OK on write, Nil when the key already exists.
        let reply: Option<String> = cmd.query_async(&mut conn).await?;
        Ok(reply.is_some())
    }

    async fn delete(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let removed: u64 = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        Ok(conn.exists(key).await?)
    }

    async fn increment(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        let mut conn = self.conn().await?;
        Ok(conn.incr(key, step).await?)
    }

    async fn decrement(&self, key: &str, step: i64) -> Result<i64, BackendError> {
        let mut conn = self.conn().await?;
        Ok(conn.decr(key, step).await?)
    }

    async fn get_with_token(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, CasToken)>, BackendError> {
        let mut conn = self.conn().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(|bytes| {
            let token = CasToken::new(bytes.clone());
            (bytes, token)
        }))
    }

    async fn compare_and_swap(
        &self,
        token: &CasToken,
        key: &str,
        value: &[u8],
        expiry: Expiry,
    ) -> Result<bool, BackendError> {
        let mut conn = self.conn().await?;
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(token.as_bytes())
            .arg(value)
            .arg(expiry.as_secs().unwrap_or(0))
            .invoke_async(&mut conn)
            .await?;
        Ok(swapped == 1)
    }

    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, BackendError> {
        if keys.is_empty() {
            return Ok(HashMap::new());
        }
        let mut conn = self.conn().await?;
        // MGET keeps request order, with Nil holes for missing keys.
        let mut cmd = redis::cmd("MGET");
        for key in keys {
            cmd.arg(key);
        }
        let values: Vec<Option<Vec<u8>>> = cmd.query_async(&mut conn).await?;
        Ok(keys
            .iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|v| (key.clone(), v)))
            .collect())
    }

    async fn multi_set(
        &self,
        entries: &[(String, Vec<u8>)],
        expiry: Expiry,
    ) -> Result<(), BackendError> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            match expiry.as_secs() {
                Some(secs) => {
                    pipe.cmd("SETEX").arg(key).arg(secs).arg(value).ignore();
                }
                None => {
                    pipe.cmd("SET").arg(key).arg(value).ignore();
                }
            }
        }
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn multi_delete(&self, keys: &[String]) -> Result<(), BackendError> {
        if keys.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn().await?;
        let mut cmd = redis::cmd("DEL");
        for key in keys {
            cmd.arg(key);
        }
        cmd.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn flush(&self) -> Result<(), BackendError> {
        let mut conn = self.conn().await?;
        redis::cmd("FLUSHDB").query_async::<()>(&mut conn).await?;
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

/// Builds one connected [`RedisBackend`] per cluster node.
#[derive(Debug, Clone)]
pub struct RedisConnector {
    connect_timeout: Duration,
}

impl RedisConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        RedisConnector { connect_timeout }
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self, addr: &ServerAddr) -> Result<Arc<dyn Backend>, BackendError> {
        let backend = RedisBackend::new(self.connect_timeout);
        backend.add_server(addr.clone());
        Backend::connect(&backend).await?;
        Ok(Arc::new(backend))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_without_a_connection_report_unreachable() {
        let backend = RedisBackend::new(Duration::from_millis(100));
        let err = backend.get("k").await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[tokio::test]
    async fn connect_without_servers_is_unreachable() {
        let backend = RedisBackend::new(Duration::from_millis(100));
        let err = Backend::connect(&backend).await.unwrap_err();
        assert!(err.is_unreachable());
    }

    #[test]
    fn server_list_roundtrip() {
        let backend = RedisBackend::new(Duration::from_millis(100));
        backend.add_server(ServerAddr::new("cache-1", 6379));
        backend.add_server(ServerAddr::new("cache-2", 6379));
        assert_eq!(backend.server_list().len(), 2);
        backend.reset_server_list();
        assert!(backend.server_list().is_empty());
    }
}
