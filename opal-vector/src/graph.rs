//! Graph layer adjacency for the HNSW index

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// One layer of the HNSW graph: node key to neighbor map, neighbor map being
/// neighbor key to precomputed (rounded) edge distance.
///
/// Neighbor lookup must stay O(1); the search loops depend on it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphLayer {
    nodes: HashMap<String, HashMap<String, f64>>,
}

impl GraphLayer {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.nodes.contains_key(key)
    }

    pub fn neighbors(&self, key: &str) -> Option<&HashMap<String, f64>> {
        self.nodes.get(key)
    }

    /// Replace a node's adjacency, inserting the node if absent.
    pub fn set_neighbors(&mut self, key: &str, neighbors: HashMap<String, f64>) {
        self.nodes.insert(key.to_string(), neighbors);
    }

    /// Insert a node with no neighbors if it is not already present.
    pub fn ensure(&mut self, key: &str) {
        self.nodes.entry(key.to_string()).or_default();
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.nodes.keys()
    }
}

/// The layer sequence shared between the index and the persistent node store.
///
/// The store expands prefetches over this adjacency; after a metadata load
/// replaces the sequence, the store's handle must be rebound to the new one
/// before the ready latch is released.
#[derive(Clone, Default)]
pub(crate) struct SharedLayers(Arc<RwLock<Vec<GraphLayer>>>);

impl SharedLayers {
    pub(crate) fn new(layers: Vec<GraphLayer>) -> Self {
        Self(Arc::new(RwLock::new(layers)))
    }

    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Vec<GraphLayer>> {
        self.0.read().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Vec<GraphLayer>> {
        self.0.write().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_lookup_neighbors() {
        let mut layer = GraphLayer::default();
        layer.set_neighbors("a", HashMap::from([("b".to_string(), 0.25)]));

        assert!(layer.contains("a"));
        assert!(!layer.contains("b"));
        assert_eq!(layer.neighbors("a").unwrap().get("b"), Some(&0.25));
    }

    #[test]
    fn test_ensure_keeps_existing_adjacency() {
        let mut layer = GraphLayer::default();
        layer.set_neighbors("a", HashMap::from([("b".to_string(), 0.5)]));
        layer.ensure("a");

        assert_eq!(layer.neighbors("a").unwrap().len(), 1);

        layer.ensure("c");
        assert!(layer.neighbors("c").unwrap().is_empty());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut layer = GraphLayer::default();
        layer.set_neighbors(
            "a",
            HashMap::from([("b".to_string(), 0.125), ("c".to_string(), 0.5)]),
        );
        layer.ensure("b");

        let bytes = bincode::serialize(&layer).unwrap();
        let decoded: GraphLayer = bincode::deserialize(&bytes).unwrap();

        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.neighbors("a").unwrap().get("c"), Some(&0.5));
        assert!(decoded.neighbors("b").unwrap().is_empty());
    }
}
