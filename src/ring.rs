//! Consistent-hash sharding ring
//!
//! Each physical node owns `slot_size` virtual positions derived from
//! `host:port_slot`, which bounds remapping to O(1/N) of the keyspace when
//! a node leaves. Routing is pure: connection checking and the
//! evict-and-retry healing policy live in the sharded client.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::node::Node;

/// Ring position for a key.
fn position(key: &str) -> u32 {
    crc32fast::hash(key.as_bytes())
}

/// One node's share of a multi-key batch: the `(caller_key, routed_key)`
/// pairs preserve the reverse map needed to rehydrate results.
#[derive(Debug)]
pub struct KeyGroup {
    pub node: Arc<Node>,
    pub keys: Vec<(String, String)>,
}

/// Ordered mapping from hash position to node.
#[derive(Debug, Default)]
pub struct HashRing {
    slots: BTreeMap<u32, Arc<Node>>,
    slot_size: usize,
}

impl HashRing {
    pub fn new(slot_size: usize) -> Self {
        HashRing {
            slots: BTreeMap::new(),
            slot_size: slot_size.max(1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Insert `slot_size` virtual positions for the node.
    pub fn add_node(&mut self, node: Arc<Node>) {
        for slot in 0..self.slot_size {
            self.slots
                .insert(position(&node.server_key(slot)), Arc::clone(&node));
        }
    }

    /// Delete every virtual position owned by the node. Idempotent.
    pub fn remove_node(&mut self, node: &Node) {
        for slot in 0..self.slot_size {
            let pos = position(&node.server_key(slot));
            // Hash collisions between nodes are possible; only remove a slot
            // this node actually owns.
            if self.slots.get(&pos).is_some_and(|n| n.id() == node.id()) {
                self.slots.remove(&pos);
            }
        }
    }

    /// First position at or after the key's hash, wrapping to the lowest
    /// position when the hash exceeds the ring maximum. `None` when empty.
    pub fn route(&self, key: &str) -> Option<Arc<Node>> {
        let hash = position(key);
        self.slots
            .range(hash..)
            .next()
            .or_else(|| self.slots.iter().next())
            .map(|(_, node)| Arc::clone(node))
    }

    /// Group `(caller_key, routed_key)` pairs by owning node so multi-key
    /// operations become one request per physical node. `None` when the
    /// ring is empty.
    pub fn group_keys(&self, pairs: &[(String, String)]) -> Option<Vec<KeyGroup>> {
        if self.slots.is_empty() {
            return None;
        }
        let mut groups: BTreeMap<u64, KeyGroup> = BTreeMap::new();
        for (caller_key, routed_key) in pairs {
            let node = self.route(routed_key)?;
            groups
                .entry(node.id())
                .or_insert_with(|| KeyGroup {
                    node: Arc::clone(&node),
                    keys: Vec::new(),
                })
                .keys
                .push((caller_key.clone(), routed_key.clone()));
        }
        Some(groups.into_values().collect())
    }

    /// Distinct physical nodes currently on the ring.
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        let mut seen = std::collections::HashSet::new();
        self.slots
            .values()
            .filter(|node| seen.insert(node.id()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerAddr;
    use std::collections::HashMap;

    fn ring_with_nodes(count: usize, slot_size: usize) -> (HashRing, Vec<Arc<Node>>) {
        let mut ring = HashRing::new(slot_size);
        let nodes: Vec<Arc<Node>> = (0..count)
            .map(|i| Arc::new(Node::new(ServerAddr::new(format!("cache-{i}"), 6379))))
            .collect();
        for node in &nodes {
            ring.add_node(Arc::clone(node));
        }
        (ring, nodes)
    }

    #[test]
    fn routing_is_deterministic() {
        let (ring, _) = ring_with_nodes(4, 8);
        for i in 0..50 {
            let key = format!("k{i}");
            let first = ring.route(&key).unwrap().id();
            let second = ring.route(&key).unwrap().id();
            assert_eq!(first, second);
        }
    }

    #[test]
    fn empty_ring_routes_nothing() {
        let ring = HashRing::new(8);
        assert!(ring.route("k").is_none());
        assert!(ring.group_keys(&[("k".into(), "k".into())]).is_none());
    }

    #[test]
    fn removal_remaps_only_the_removed_nodes_keys() {
        let (mut ring, nodes) = ring_with_nodes(4, 8);
        let victim = &nodes[2];

        let before: HashMap<String, u64> = (1..=100)
            .map(|i| {
                let key = format!("k{i}");
                let id = ring.route(&key).unwrap().id();
                (key, id)
            })
            .collect();

        ring.remove_node(victim);

        for (key, old_id) in &before {
            let new_id = ring.route(key).unwrap().id();
            if *old_id == victim.id() {
                assert_ne!(new_id, victim.id());
            } else {
                // Keys not owned by the victim keep their destination.
                assert_eq!(new_id, *old_id);
            }
        }
    }

    #[test]
    fn removal_is_idempotent() {
        let (mut ring, nodes) = ring_with_nodes(2, 8);
        ring.remove_node(&nodes[0]);
        ring.remove_node(&nodes[0]);
        for i in 0..20 {
            assert_eq!(ring.route(&format!("k{i}")).unwrap().id(), nodes[1].id());
        }
    }

    #[test]
    fn single_node_gets_everything() {
        let (ring, nodes) = ring_with_nodes(1, 8);
        for i in 0..20 {
            assert_eq!(ring.route(&format!("k{i}")).unwrap().id(), nodes[0].id());
        }
    }

    #[test]
    fn group_keys_covers_all_pairs_with_reverse_map() {
        let (ring, _) = ring_with_nodes(3, 8);
        let pairs: Vec<(String, String)> = (0..30)
            .map(|i| (format!("k{i}"), format!("app.k{i}")))
            .collect();
        let groups = ring.group_keys(&pairs).unwrap();

        let mut total = 0;
        for group in &groups {
            for (caller_key, routed_key) in &group.keys {
                assert_eq!(routed_key, &format!("app.{caller_key}"));
                // Every pair sits on the node that routing picks.
                assert_eq!(ring.route(routed_key).unwrap().id(), group.node.id());
                total += 1;
            }
        }
        assert_eq!(total, pairs.len());
    }

    #[test]
    fn nodes_lists_distinct_members() {
        let (ring, nodes) = ring_with_nodes(4, 8);
        let listed = ring.nodes();
        assert_eq!(listed.len(), nodes.len());
    }
}
