//! Backend collaborator contract
//!
//! Everything a cache client needs from an endpoint is expressed as the
//! [`Backend`] trait: the raw primitive operations (get/set/delete/increment,
//! compare-and-swap, multi-key batches) plus server-list control used by the
//! reconnect path. Both the Redis implementation and the in-process test
//! backend implement it; clients never talk to a concrete transport type.

use std::collections::HashMap;
use std::fmt;

use async_trait::async_trait;

use crate::config::ServerAddr;

/// Normalized expiry for a stored entry.
///
/// `Forever` maps to a plain write with no expiry on the backend. The public
/// API uses `Option<u64>` seconds: `None` means "use the configured default",
/// `Some(0)` means never expire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Expiry {
    Forever,
    /// Seconds, always >= 1.
    After(u64),
}

impl Expiry {
    /// Apply the TTL convention against a configured default.
    pub fn normalize(ttl: Option<u64>, default_secs: u64) -> Self {
        match ttl {
            None => Expiry::After(default_secs.max(1)),
            Some(0) => Expiry::Forever,
            Some(secs) => Expiry::After(secs),
        }
    }

    /// Seconds until expiry, or `None` for `Forever`.
    pub fn as_secs(self) -> Option<u64> {
        match self {
            Expiry::Forever => None,
            Expiry::After(secs) => Some(secs),
        }
    }
}

/// Opaque version token captured by a CAS-flavored read.
///
/// Callers only move tokens around; the bytes inside are meaningful to the
/// backend that produced them (a version counter for the in-process backend,
/// a value snapshot for Redis).
#[derive(Clone, PartialEq, Eq)]
pub struct CasToken(Vec<u8>);

impl CasToken {
    pub(crate) fn new(bytes: Vec<u8>) -> Self {
        CasToken(bytes)
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for CasToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CasToken({} bytes)", self.0.len())
    }
}

/// Machine-readable failure category, mirrored from the backend's own result
/// codes. `Unreachable` is the one the retry state machine keys on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The endpoint cannot be reached (connect refused, dropped, timed out).
    Unreachable,
    /// The client has permanently degraded; no network was attempted.
    Disabled,
    /// Increment/decrement hit a value that is not a number.
    NotNumeric,
    /// The backend answered, but with an error.
    Protocol,
}

/// Error produced by a [`Backend`] operation.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct BackendError {
    kind: ErrorKind,
    message: String,
}

impl BackendError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        BackendError {
            kind,
            message: message.into(),
        }
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, message)
    }

    pub fn disabled() -> Self {
        Self::new(ErrorKind::Disabled, "cache client is disabled")
    }

    pub fn not_numeric(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotNumeric, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_unreachable(&self) -> bool {
        self.kind == ErrorKind::Unreachable
    }
}

/// Raw primitive operations of one cache endpoint.
///
/// Values are opaque byte strings; serialization and compression live in the
/// client layer ([`crate::codec::ValueCodec`]). Multi-key operations are
/// best-effort and not transactional across keys.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Establish (or re-establish) the connection to the configured servers.
    async fn connect(&self) -> Result<(), BackendError>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    async fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<(), BackendError>;

    /// Store only if the key is absent. Returns whether the write happened.
    async fn add(&self, key: &str, value: &[u8], expiry: Expiry) -> Result<bool, BackendError>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool, BackendError>;

    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Atomic add. Missing keys are created as if they held 0.
    async fn increment(&self, key: &str, step: i64) -> Result<i64, BackendError>;

    async fn decrement(&self, key: &str, step: i64) -> Result<i64, BackendError>;

    /// Read a value together with its opaque version token.
    async fn get_with_token(&self, key: &str)
        -> Result<Option<(Vec<u8>, CasToken)>, BackendError>;

    /// Conditioned write: succeeds only if the stored version still matches
    /// `token`. A missing key never matches.
    async fn compare_and_swap(
        &self,
        token: &CasToken,
        key: &str,
        value: &[u8],
        expiry: Expiry,
    ) -> Result<bool, BackendError>;

    /// Missing keys are simply absent from the result map.
    async fn multi_get(&self, keys: &[String]) -> Result<HashMap<String, Vec<u8>>, BackendError>;

    /// One shared expiry for the whole batch; callers group by TTL first.
    async fn multi_set(
        &self,
        entries: &[(String, Vec<u8>)],
        expiry: Expiry,
    ) -> Result<(), BackendError>;

    async fn multi_delete(&self, keys: &[String]) -> Result<(), BackendError>;

    /// Drop every entry held by this endpoint.
    async fn flush(&self) -> Result<(), BackendError>;

    fn server_list(&self) -> Vec<ServerAddr>;

    fn reset_server_list(&self);

    fn add_server(&self, addr: ServerAddr);
}

/// Produces one [`Backend`] per cluster node. The sharded client uses this to
/// bind node connections lazily, which is what lets the ring evict a node
/// whose endpoint turns out to be dead.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, addr: &ServerAddr) -> Result<std::sync::Arc<dyn Backend>, BackendError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expiry_normalization() {
        assert_eq!(Expiry::normalize(None, 1800), Expiry::After(1800));
        assert_eq!(Expiry::normalize(Some(0), 1800), Expiry::Forever);
        assert_eq!(Expiry::normalize(Some(60), 1800), Expiry::After(60));
        // A zero default still yields a usable positive TTL.
        assert_eq!(Expiry::normalize(None, 0), Expiry::After(1));
    }

    #[test]
    fn token_debug_is_opaque() {
        let token = CasToken::new(vec![1, 2, 3]);
        assert_eq!(format!("{:?}", token), "CasToken(3 bytes)");
    }

    #[test]
    fn error_kind_helpers() {
        assert!(BackendError::unreachable("down").is_unreachable());
        assert_eq!(BackendError::disabled().kind(), ErrorKind::Disabled);
        assert!(!BackendError::not_numeric("nan").is_unreachable());
    }
}
