//! Client configuration

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CacheError;

/// One cache endpoint, parsed from a `host:port` string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServerAddr {
    pub host: String,
    pub port: u16,
}

impl ServerAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ServerAddr {
            host: host.into(),
            port,
        }
    }
}

impl FromStr for ServerAddr {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| CacheError::Config(format!("endpoint `{s}` is missing a port")))?;
        let host = host.trim();
        if host.is_empty() {
            return Err(CacheError::Config(format!(
                "endpoint `{s}` has an empty host"
            )));
        }
        let port = port
            .trim()
            .parse::<u16>()
            .map_err(|_| CacheError::Config(format!("endpoint `{s}` has an invalid port")))?;
        Ok(ServerAddr::new(host, port))
    }
}

impl fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Configuration for a cache client.
///
/// Endpoint mistakes are the one class of error that is fatal at
/// construction time; everything after that degrades gracefully.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Backend endpoints. One entry for the single-node client, one per
    /// physical node for the sharded client.
    pub servers: Vec<ServerAddr>,
    /// Category prefix applied to every backend-visible key (`prefix.key`).
    pub key_prefix: Option<String>,
    /// Default TTL in seconds applied when a write carries none.
    pub default_ttl: u64,
    /// Virtual slots per physical node on the hash ring.
    pub slot_size: usize,
    /// Timeout for establishing a backend connection.
    pub connect_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            key_prefix: None,
            default_ttl: 1800, // 30 minutes
            slot_size: 24,
            connect_timeout: Duration::from_millis(500),
        }
    }
}

impl CacheConfig {
    /// Build a config from `host:port` endpoint strings.
    pub fn from_endpoints<S: AsRef<str>>(endpoints: &[S]) -> Result<Self, CacheError> {
        let servers = endpoints
            .iter()
            .map(|endpoint| endpoint.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            servers,
            ..Self::default()
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    pub fn with_default_ttl(mut self, secs: u64) -> Self {
        self.default_ttl = secs;
        self
    }

    pub fn with_slot_size(mut self, slots: usize) -> Self {
        self.slot_size = slots;
        self
    }

    /// Fatal check used by the client constructors.
    pub(crate) fn require_servers(&self) -> Result<(), CacheError> {
        if self.servers.is_empty() {
            return Err(CacheError::Config("no cache endpoints configured".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_endpoints() {
        let config = CacheConfig::from_endpoints(&["cache-1:6379", " cache-2 :6380"]).unwrap();
        assert_eq!(config.servers.len(), 2);
        assert_eq!(config.servers[0], ServerAddr::new("cache-1", 6379));
        assert_eq!(config.servers[1], ServerAddr::new("cache-2", 6380));
    }

    #[test]
    fn rejects_malformed_endpoints() {
        assert!(matches!(
            CacheConfig::from_endpoints(&["no-port"]),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_endpoints(&["host:notaport"]),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            CacheConfig::from_endpoints(&[":6379"]),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.default_ttl, 1800);
        assert_eq!(config.slot_size, 24);
        assert!(config.require_servers().is_err());
    }
}
