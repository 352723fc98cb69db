//! cachering — unified caching client with consistent-hash sharding,
//! optimistic concurrency and deferred writes.
//!
//! One [`CacheClient`] surface covers two topologies:
//!
//! - [`SingleNodeCacheClient`]: one endpoint behind a retry-then-disable
//!   connection supervisor, with a deferred-write transaction buffer.
//! - [`ShardedCacheClient`]: a cluster spread over a consistent hash ring
//!   that evicts dead nodes and degrades gracefully down to zero.
//!
//! Values are JSON-serialized and transparently zlib-compressed past a size
//! threshold. Check-and-set sessions (`cas_get`/`cas_set`) carry opaque
//! version tokens in an internal ledger, so callers never juggle tokens for
//! the common read-modify-write loop.
//!
//! ```no_run
//! use cachering::{CacheClient, CacheConfig, CacheFactory};
//!
//! # async fn demo() -> Result<(), cachering::CacheError> {
//! let config = CacheConfig::from_endpoints(&["127.0.0.1:6379"])?
//!     .with_key_prefix("sessions");
//! let cache = CacheFactory::single_redis(config)?;
//!
//! cache.set("user.42", &"alice".to_string(), Some(600)).await;
//! cache.commit().await;
//! let name: Option<String> = cache.get("user.42").await;
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod cas;
pub mod client;
pub mod codec;
pub mod config;
pub mod error;
pub mod factory;
pub mod hook;
pub mod memory;
pub mod node;
pub mod redis;
pub mod retry;
pub mod ring;
pub mod sharded;
pub mod single;
pub mod txn;

pub use self::backend::{Backend, BackendError, CasToken, Connector, ErrorKind, Expiry};
pub use self::client::{CacheClient, WriteEntry};
pub use self::codec::{CodecError, ValueCodec};
pub use self::config::{CacheConfig, ServerAddr};
pub use self::error::CacheError;
pub use self::factory::{CacheFactory, CacheHandle};
pub use self::hook::{NullHook, ObservabilityHook, OpRecord, TracingHook};
pub use self::memory::{MemoryBackend, MemoryConnector};
pub use self::redis::{RedisBackend, RedisConnector};
pub use self::retry::{LinkState, RetryableClient};
pub use self::sharded::ShardedCacheClient;
pub use self::single::SingleNodeCacheClient;
