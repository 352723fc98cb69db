//! Cluster node identity and lazy connection binding

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::OnceCell;

use crate::backend::{Backend, BackendError, Connector};
use crate::config::ServerAddr;

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// One physical cache endpoint registered on the ring.
///
/// The id is process-lifetime unique and monotonic; it is what multi-key
/// batching groups by. The connection is bound on first use so building a
/// ring never touches the network.
pub struct Node {
    id: u64,
    addr: ServerAddr,
    connection: OnceCell<Arc<dyn Backend>>,
}

impl Node {
    pub fn new(addr: ServerAddr) -> Self {
        Node {
            id: NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed),
            addr,
            connection: OnceCell::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    /// Synthetic ring-key for one of this node's virtual slots.
    pub fn server_key(&self, slot: usize) -> String {
        format!("{}:{}_{}", self.addr.host, self.addr.port, slot)
    }

    /// The backend connection, established on first call. A failure here is
    /// what triggers eviction from the ring.
    pub async fn backend(&self, connector: &dyn Connector) -> Result<Arc<dyn Backend>, BackendError> {
        self.connection
            .get_or_try_init(|| connector.connect(&self.addr))
            .await
            .cloned()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_monotonic() {
        let a = Node::new(ServerAddr::new("h", 1));
        let b = Node::new(ServerAddr::new("h", 2));
        assert!(b.id() > a.id());
    }

    #[test]
    fn server_key_includes_slot() {
        let node = Node::new(ServerAddr::new("cache-1", 6379));
        assert_eq!(node.server_key(0), "cache-1:6379_0");
        assert_eq!(node.server_key(7), "cache-1:6379_7");
    }
}
