//! Node stores: where embeddings live
//!
//! The index sees one capability; the backing is either a plain in-memory
//! map or the OpalDB storage layer fronted by an LRU cache with a
//! graph-driven prefetcher.

use crate::distance::OrderedFloat;
use crate::graph::SharedLayers;
use crate::lru::LruCache;
use crate::{Result, VectorError};
use opal_storage::{StorageEngine, Table};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

/// Name of the logical table holding node embeddings.
const NODES_TABLE: &str = "nodes";

/// Penalty added per layer of distance when warming the cache across layers,
/// so nearer layers are prefetched first.
const CROSS_LAYER_PENALTY: f64 = 0.1;

/// A stored node: its embedding and the soft-delete flag.
///
/// Deleted nodes stay in the store and in the graph so traversal through
/// them keeps working; they are invisible to query results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub vector: Vec<f64>,
    pub deleted: bool,
}

impl Node {
    pub fn new(vector: Vec<f64>) -> Self {
        Self {
            vector,
            deleted: false,
        }
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|e| VectorError::Serialization(e.to_string()))
    }

    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| VectorError::Serialization(e.to_string()))
    }
}

/// In-memory node store.
#[derive(Default)]
pub struct MemoryNodeStore {
    nodes: HashMap<String, Node>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Persistent node store: authoritative data in the `nodes` table, fronted
/// by an LRU cache that is warmed by BFS prefetch over the graph adjacency.
pub struct PersistentNodeStore {
    table: Table,
    cache: LruCache<String, Node>,
    layers: SharedLayers,
    target_cache_bytes: usize,
    prefetch_size_override: Option<usize>,
}

impl PersistentNodeStore {
    /// Initial cache capacity before the embedding dimension is known.
    const INITIAL_CAPACITY: usize = 4096;

    pub(crate) fn new(
        engine: Arc<StorageEngine>,
        layers: SharedLayers,
        target_cache_bytes: usize,
        prefetch_size_override: Option<usize>,
    ) -> Self {
        Self {
            table: Table::new(engine, NODES_TABLE),
            cache: LruCache::new(Self::INITIAL_CAPACITY),
            layers,
            target_cache_bytes,
            prefetch_size_override,
        }
    }

    /// Rebind the adjacency handle after a metadata load replaced the layer
    /// sequence. Must happen before the index releases its ready latch.
    pub(crate) fn rebind_layers(&mut self, layers: SharedLayers) {
        self.layers = layers;
    }

    /// Recompute the cache entry budget once the embedding dimension is
    /// known: `target_cache_bytes / (8 * dim)` entries. Empties the cache.
    pub(crate) fn on_dimension(&mut self, dim: usize) {
        let capacity = self.target_cache_bytes / (8 * dim.max(1));
        self.cache.reallocate(capacity);
    }

    /// Warm the cache with the graph neighborhood of `key` at `level`.
    ///
    /// Best-first BFS prioritized by cumulative edge distance. Candidates
    /// found in other layers are followed with a per-layer penalty when they
    /// also exist in the current layer, and fetched without expansion when
    /// they do not. One batched read at the end populates the cache.
    async fn prefetch(&mut self, key: &str, level: usize) -> Result<()> {
        let budget = self
            .prefetch_size_override
            .unwrap_or_else(|| self.cache.capacity());

        let mut pending: Vec<String> = Vec::new();
        {
            let layers = self.layers.read();
            if level >= layers.len() {
                return Ok(());
            }

            let mut heap: BinaryHeap<Reverse<(OrderedFloat, u64, String)>> = BinaryHeap::new();
            let mut seq: u64 = 0;
            let mut visited: HashSet<String> = HashSet::new();
            let mut pending_set: HashSet<String> = HashSet::new();

            heap.push(Reverse((OrderedFloat(0.0), seq, key.to_string())));

            while let Some(Reverse((OrderedFloat(cost), _, current))) = heap.pop() {
                if pending.len() >= budget {
                    break;
                }
                if !visited.insert(current.clone()) {
                    continue;
                }
                if !self.cache.contains(&current) && pending_set.insert(current.clone()) {
                    pending.push(current.clone());
                }

                if let Some(neighbors) = layers[level].neighbors(&current) {
                    for (neighbor, edge) in neighbors {
                        seq += 1;
                        heap.push(Reverse((
                            OrderedFloat(cost + edge),
                            seq,
                            neighbor.clone(),
                        )));
                    }
                }

                for (other, layer) in layers.iter().enumerate() {
                    if other == level || !layer.contains(&current) {
                        continue;
                    }
                    let penalty = CROSS_LAYER_PENALTY * (other.abs_diff(level)) as f64;
                    if let Some(neighbors) = layer.neighbors(&current) {
                        for (neighbor, edge) in neighbors {
                            if layers[level].contains(neighbor) {
                                seq += 1;
                                heap.push(Reverse((
                                    OrderedFloat(cost + edge + penalty),
                                    seq,
                                    neighbor.clone(),
                                )));
                            } else if pending.len() < budget
                                && !self.cache.contains(neighbor)
                                && pending_set.insert(neighbor.clone())
                            {
                                pending.push(neighbor.clone());
                            }
                        }
                    }
                }
            }
        }

        if pending.is_empty() {
            return Ok(());
        }

        let values = self.table.multi_get(&pending).await?;
        for (id, value) in pending.into_iter().zip(values) {
            if let Some(bytes) = value {
                self.cache.put(id, Node::decode(&bytes)?);
            }
        }
        Ok(())
    }
}

/// The node-store capability used by the index.
pub enum NodeStore {
    Memory(MemoryNodeStore),
    Persistent(PersistentNodeStore),
}

impl NodeStore {
    pub async fn len(&self) -> Result<usize> {
        match self {
            NodeStore::Memory(store) => Ok(store.nodes.len()),
            NodeStore::Persistent(store) => Ok(store.table.count().await?),
        }
    }

    pub async fn contains(&self, key: &str) -> Result<bool> {
        match self {
            NodeStore::Memory(store) => Ok(store.nodes.contains_key(key)),
            NodeStore::Persistent(store) => {
                if store.cache.contains(&key.to_string()) {
                    return Ok(true);
                }
                Ok(store.table.get(key).await?.is_some())
            }
        }
    }

    /// Fetch a node. `level` hints the persistent variant's prefetcher at
    /// which adjacency to walk; the in-memory variant ignores it.
    ///
    /// A miss that survives prefetch means the graph references an embedding
    /// that was never written; that is a fatal index error.
    pub async fn get(&mut self, key: &str, level: usize) -> Result<Node> {
        match self {
            NodeStore::Memory(store) => store
                .nodes
                .get(key)
                .cloned()
                .ok_or_else(|| VectorError::MissingNode(key.to_string())),
            NodeStore::Persistent(store) => {
                if let Some(node) = store.cache.get(&key.to_string()) {
                    return Ok(node.clone());
                }
                store.prefetch(key, level).await?;
                if let Some(node) = store.cache.get(&key.to_string()) {
                    return Ok(node.clone());
                }
                Err(VectorError::MissingNode(key.to_string()))
            }
        }
    }

    pub async fn set(&mut self, key: &str, node: Node) -> Result<()> {
        match self {
            NodeStore::Memory(store) => {
                store.nodes.insert(key.to_string(), node);
                Ok(())
            }
            NodeStore::Persistent(store) => {
                store.table.put(key, &node.encode()?).await?;
                store.cache.put(key.to_string(), node);
                Ok(())
            }
        }
    }

    pub async fn bulk_set(&mut self, entries: Vec<(String, Node)>) -> Result<()> {
        match self {
            NodeStore::Memory(store) => {
                store.nodes.extend(entries);
                Ok(())
            }
            NodeStore::Persistent(store) => {
                let mut encoded = Vec::with_capacity(entries.len());
                for (key, node) in &entries {
                    encoded.push((key.clone(), node.encode()?));
                }
                store.table.put_many(&encoded).await?;
                for (key, node) in entries {
                    store.cache.put(key, node);
                }
                Ok(())
            }
        }
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        match self {
            NodeStore::Memory(store) => Ok(store.nodes.keys().cloned().collect()),
            NodeStore::Persistent(store) => Ok(store.table.keys().await?),
        }
    }

    pub async fn clear(&mut self) -> Result<()> {
        match self {
            NodeStore::Memory(store) => {
                store.nodes.clear();
                Ok(())
            }
            NodeStore::Persistent(store) => {
                store.table.clear().await?;
                store.cache.clear();
                Ok(())
            }
        }
    }

    pub(crate) fn rebind_layers(&mut self, layers: SharedLayers) {
        if let NodeStore::Persistent(store) = self {
            store.rebind_layers(layers);
        }
    }

    pub(crate) fn on_dimension(&mut self, dim: usize) {
        if let NodeStore::Persistent(store) = self {
            store.on_dimension(dim);
        }
    }
}
