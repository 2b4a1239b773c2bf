//! HNSW (Hierarchical Navigable Small World) graph core
//!
//! A multi-layer proximity graph:
//! - Layer 0 contains every node
//! - Higher layers contain progressively fewer nodes
//! - Each node connects to at most `m` neighbors per layer (`m_max_0` at
//!   layer 0), chosen by a diversity-preserving heuristic
//!
//! Search starts at the entry point in the top layer, greedily descends to
//! layer 1, then runs a bounded-beam search at layer 0. Soft-deleted nodes
//! are traversed but never returned.

use crate::distance::{self, DistanceCache, DistanceFn, DistanceKind, OrderedFloat};
use crate::graph::{GraphLayer, SharedLayers};
use crate::store::{Node, NodeStore};
use crate::{Result, VectorError};
use opal_storage::Table;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use tracing::{debug, warn};

/// Hard cap on sampled insertion levels.
const MAX_LEVEL: usize = 16;

/// Record id of the index metadata inside the `metadata` table.
const METADATA_KEY: &str = "graph";

/// Configuration for the HNSW index
#[derive(Debug, Clone)]
pub struct HnswConfig {
    /// Distance function applied to stored vectors
    pub distance_kind: DistanceKind,

    /// The callable backing [`DistanceKind::Custom`]
    pub custom_distance: Option<DistanceFn>,

    /// Target number of bi-directional links per node per layer (M)
    pub m: usize,

    /// Neighbor cap for layer 0 (typically M * 2)
    pub m_max_0: usize,

    /// Size of the dynamic candidate list during insertion (ef_construction)
    pub ef_construction: usize,

    /// Size of the dynamic candidate list during search (ef_search)
    pub ef_search: usize,

    /// Normalization factor for level selection (ml), typically 1 / ln(M)
    pub ml: f64,

    /// Decimal places edge distances are rounded to before storage
    pub distance_precision: u32,

    /// Seed for the level-sampling RNG; fixed seeds give deterministic
    /// topologies
    pub seed: u64,

    /// Persist graph metadata and node embeddings
    pub use_persistence: bool,

    /// Truncate any persisted state instead of loading it
    pub clear_on_init: bool,

    /// Override the prefetch batch budget (defaults to the cache capacity)
    pub prefetch_size_override: Option<usize>,

    /// Byte budget for the node-embedding cache
    pub target_cache_bytes: usize,

    /// Debounced incremental saves after every mutation
    pub autosave_enabled: bool,

    /// Autosave debounce delay in milliseconds
    pub autosave_delay_ms: u64,
}

impl Default for HnswConfig {
    fn default() -> Self {
        let m = 16;
        Self {
            distance_kind: DistanceKind::CosinePrenormalized,
            custom_distance: None,
            m,
            m_max_0: m * 2,
            ef_construction: 100,
            ef_search: 100,
            ml: 1.0 / (m as f64).ln(),
            distance_precision: 6,
            seed: rand::random(),
            use_persistence: true,
            clear_on_init: false,
            prefetch_size_override: None,
            target_cache_bytes: 50 * 1024 * 1024,
            autosave_enabled: false,
            autosave_delay_ms: 5000,
        }
    }
}

impl HnswConfig {
    /// Create a fast configuration (less accuracy, faster search)
    pub fn fast() -> Self {
        let m = 8;
        Self {
            m,
            m_max_0: m * 2,
            ef_construction: 100,
            ef_search: 50,
            ml: 1.0 / (m as f64).ln(),
            ..Self::default()
        }
    }

    /// Create a balanced configuration (default)
    pub fn balanced() -> Self {
        Self::default()
    }

    /// Create a high-quality configuration (better accuracy, slower search)
    pub fn high_quality() -> Self {
        let m = 32;
        Self {
            m,
            m_max_0: m * 2,
            ef_construction: 400,
            ef_search: 200,
            ml: 1.0 / (m as f64).ln(),
            ..Self::default()
        }
    }
}

/// Result of a k-nearest-neighbor query: parallel arrays of keys and their
/// distances to the query vector, ascending.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub keys: Vec<String>,
    pub distances: Vec<f64>,
}

/// Node accounting across the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStats {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub deleted_nodes: usize,
}

/// Unsaved-mutation accounting since the last successful save.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirtyStats {
    /// Distinct keys with unsaved mutations
    pub dirty_nodes: usize,
    /// Total (key, layer) pairs with unsaved mutations
    pub dirty_entries: usize,
}

/// The persisted index metadata record.
///
/// Together with the node embeddings in the `nodes` table this suffices to
/// reconstruct the exact graph. Adding a field is a minor revision; removing
/// or repurposing one requires a version bump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSnapshot {
    pub distance_kind: DistanceKind,
    pub m: usize,
    pub ef_construction: usize,
    pub m_max_0: usize,
    pub ml: f64,
    pub seed: u64,
    pub use_persistence: bool,
    pub entry_point_key: Option<String>,
    pub layers: Vec<GraphLayer>,
}

/// The index state machine. Lives behind the [`crate::VectorIndex`] mutex;
/// every method assumes it is the only one running.
pub(crate) struct HnswCore {
    config: HnswConfig,
    layers: SharedLayers,
    entry_point: Option<String>,
    store: NodeStore,
    metadata: Option<Table>,
    dim: Option<usize>,
    rng: StdRng,
    dirty: HashSet<(String, usize)>,
    distance_cache: DistanceCache,
}

impl HnswCore {
    pub(crate) fn new(
        config: HnswConfig,
        layers: SharedLayers,
        store: NodeStore,
        metadata: Option<Table>,
    ) -> Self {
        if config.distance_kind == DistanceKind::Custom && config.custom_distance.is_none() {
            warn!("custom distance selected without a callable; using cosine");
        }
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            config,
            layers,
            entry_point: None,
            store,
            metadata,
            dim: None,
            rng,
            dirty: HashSet::new(),
            distance_cache: DistanceCache::new(1024, false),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entry_point.is_none()
    }

    pub(crate) fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot {
            distance_kind: self.config.distance_kind,
            m: self.config.m,
            ef_construction: self.config.ef_construction,
            m_max_0: self.config.m_max_0,
            ml: self.config.ml,
            seed: self.config.seed,
            use_persistence: self.config.use_persistence,
            entry_point_key: self.entry_point.clone(),
            layers: self.layers.read().clone(),
        }
    }

    pub(crate) fn dirty_stats(&self) -> DirtyStats {
        let dirty_nodes = self
            .dirty
            .iter()
            .map(|(key, _)| key.as_str())
            .collect::<HashSet<_>>()
            .len();
        DirtyStats {
            dirty_nodes,
            dirty_entries: self.dirty.len(),
        }
    }

    pub(crate) async fn stats(&mut self) -> Result<IndexStats> {
        let keys = self.store.keys().await?;
        let total_nodes = keys.len();
        let mut deleted_nodes = 0;
        for key in keys {
            if self.store.get(&key, 0).await?.deleted {
                deleted_nodes += 1;
            }
        }
        Ok(IndexStats {
            total_nodes,
            active_nodes: total_nodes - deleted_nodes,
            deleted_nodes,
        })
    }

    pub(crate) async fn contains(&self, key: &str) -> Result<bool> {
        self.store.contains(key).await
    }

    pub(crate) async fn is_live(&mut self, key: &str) -> Result<bool> {
        if !self.store.contains(key).await? {
            return Ok(false);
        }
        Ok(!self.store.get(key, 0).await?.deleted)
    }

    // ---- insert -----------------------------------------------------------

    pub(crate) async fn insert(
        &mut self,
        key: &str,
        vector: Vec<f64>,
        level: Option<usize>,
    ) -> Result<()> {
        if self.store.contains(key).await? {
            let node = self.store.get(key, 0).await?;
            if !node.deleted {
                return Err(VectorError::Duplicate(key.to_string()));
            }
            // Soft-deleted key: revive it in place, keeping its level
            self.check_dim(&vector)?;
            self.store.set(key, Node::new(vector.clone())).await?;
            return self.update(key, vector).await;
        }

        self.check_dim(&vector)?;
        let level = match level {
            Some(level) => level.min(MAX_LEVEL),
            None => self.random_level(),
        };
        self.store.set(key, Node::new(vector.clone())).await?;

        let Some(entry) = self.entry_point.clone() else {
            // First node: it is the entire graph
            let mut layers = self.layers.write();
            layers.clear();
            for _ in 0..=level {
                let mut layer = GraphLayer::default();
                layer.ensure(key);
                layers.push(layer);
            }
            drop(layers);
            self.entry_point = Some(key.to_string());
            self.mark_dirty_span(key, level);
            return Ok(());
        };

        let top = self.layers.len() - 1;
        let entry_node = self.store.get(&entry, top).await?;
        let mut best = (entry, self.compute(&vector, &entry_node.vector));

        for layer in ((level + 1)..=top).rev() {
            best = self.search_layer_ef1(&vector, best, layer, true).await?;
        }

        for layer in (0..=level.min(top)).rev() {
            let candidates = self
                .search_layer(
                    &vector,
                    std::slice::from_ref(&best),
                    self.config.ef_construction,
                    layer,
                    false,
                )
                .await?;

            let max_links = self.max_links(layer);
            let selected = self.select_neighbors(candidates.clone(), max_links, layer).await?;
            self.set_neighbors(layer, key, &selected);

            // Each chosen neighbor reconsiders its own adjacency with the
            // new node as a candidate
            for (neighbor, edge) in &selected {
                let mut reconsider: Vec<(String, f64)> = {
                    let layers = self.layers.read();
                    layers[layer]
                        .neighbors(neighbor)
                        .map(|n| n.iter().map(|(k, d)| (k.clone(), *d)).collect())
                        .unwrap_or_default()
                };
                reconsider.push((key.to_string(), *edge));
                let pruned = self.select_neighbors(reconsider, max_links, layer).await?;
                self.set_neighbors(layer, neighbor, &pruned);
            }

            if let Some(closest) = candidates.first() {
                best = closest.clone();
            }
        }

        if level > top {
            let mut layers = self.layers.write();
            for _ in (top + 1)..=level {
                let mut layer = GraphLayer::default();
                layer.ensure(key);
                layers.push(layer);
            }
            drop(layers);
            self.entry_point = Some(key.to_string());
        }

        self.mark_dirty_span(key, level);
        Ok(())
    }

    pub(crate) async fn bulk_insert(&mut self, entries: Vec<(String, Vec<f64>)>) -> Result<()> {
        for (key, vector) in entries {
            self.insert(&key, vector, None).await?;
        }
        Ok(())
    }

    // ---- update -----------------------------------------------------------

    pub(crate) async fn update(&mut self, key: &str, vector: Vec<f64>) -> Result<()> {
        if !self.store.contains(key).await? {
            return Err(VectorError::NotFound(key.to_string()));
        }
        self.check_dim(&vector)?;

        let mut node = self.store.get(key, 0).await?;
        node.vector = vector.clone();
        self.store.set(key, node).await?;

        if self.entry_point.as_deref() == Some(key) && self.store.len().await? == 1 {
            self.mark_dirty_span(key, self.layers.len().saturating_sub(1));
            return Ok(());
        }

        // Repair each first-degree neighbor against the second-degree
        // neighborhood of the moved node
        let layer_count = self.layers.len();
        for layer in 0..layer_count {
            let (first_degree, neighborhood) = {
                let layers = self.layers.read();
                if !layers[layer].contains(key) {
                    continue;
                }
                let first: Vec<String> = layers[layer]
                    .neighbors(key)
                    .map(|n| n.keys().cloned().collect())
                    .unwrap_or_default();

                let mut seen: HashSet<String> = HashSet::new();
                let mut hood: Vec<String> = Vec::new();
                seen.insert(key.to_string());
                hood.push(key.to_string());
                for hop in &first {
                    if seen.insert(hop.clone()) {
                        hood.push(hop.clone());
                    }
                }
                for hop in &first {
                    if let Some(second) = layers[layer].neighbors(hop) {
                        for far in second.keys() {
                            if seen.insert(far.clone()) {
                                hood.push(far.clone());
                            }
                        }
                    }
                }
                (first, hood)
            };

            let max_links = self.max_links(layer);
            for neighbor in &first_degree {
                let mut closest: BinaryHeap<(OrderedFloat, u64, String)> = BinaryHeap::new();
                let mut seq: u64 = 0;
                for candidate in &neighborhood {
                    if candidate == neighbor {
                        continue;
                    }
                    let d = self.distance_between(neighbor, candidate, layer).await?;
                    closest.push((OrderedFloat(d), seq, candidate.clone()));
                    seq += 1;
                    if closest.len() > self.config.ef_construction {
                        closest.pop();
                    }
                }
                let mut candidates: Vec<(String, f64)> = closest
                    .into_iter()
                    .map(|(OrderedFloat(d), _, k)| (k, d))
                    .collect();
                candidates.sort_by(|a, b| {
                    a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal)
                });

                let pruned = self.select_neighbors(candidates, max_links, layer).await?;
                self.set_neighbors(layer, neighbor, &pruned);
            }
        }

        // Re-route the moved node's own outgoing edges by replaying the
        // insert descent
        let node_top = {
            let layers = self.layers.read();
            (0..layers.len())
                .rev()
                .find(|&layer| layers[layer].contains(key))
        };
        let Some(node_top) = node_top else {
            return Ok(());
        };

        let top = layer_count - 1;
        let entry = self
            .entry_point
            .clone()
            .ok_or_else(|| VectorError::Index("non-empty index without entry point".to_string()))?;
        let entry_node = self.store.get(&entry, top).await?;
        let mut best = (entry, self.compute(&vector, &entry_node.vector));

        for layer in ((node_top + 1)..=top).rev() {
            best = self.search_layer_ef1(&vector, best, layer, true).await?;
        }

        for layer in (0..=node_top).rev() {
            let mut candidates = self
                .search_layer(
                    &vector,
                    std::slice::from_ref(&best),
                    self.config.ef_construction + 1,
                    layer,
                    false,
                )
                .await?;
            candidates.retain(|(candidate, _)| candidate != key);

            let selected = self
                .select_neighbors(candidates.clone(), self.max_links(layer), layer)
                .await?;
            self.set_neighbors(layer, key, &selected);
            self.dirty.insert((key.to_string(), layer));

            if let Some(closest) = candidates.first() {
                best = closest.clone();
            }
        }

        Ok(())
    }

    // ---- soft delete ------------------------------------------------------

    pub(crate) async fn mark_deleted(&mut self, key: &str) -> Result<()> {
        if !self.store.contains(key).await? {
            return Err(VectorError::NotFound(key.to_string()));
        }
        let mut node = self.store.get(key, 0).await?;
        node.deleted = true;
        self.store.set(key, node).await?;

        if self.entry_point.as_deref() == Some(key) {
            self.migrate_entry_point(key).await?;
        }

        // Migration may have emptied the index, which persists itself
        if self.entry_point.is_some() {
            let occupied: Vec<usize> = {
                let layers = self.layers.read();
                (0..layers.len())
                    .filter(|&layer| layers[layer].contains(key))
                    .collect()
            };
            for layer in occupied {
                self.dirty.insert((key.to_string(), layer));
            }
        }
        Ok(())
    }

    pub(crate) async fn unmark_deleted(&mut self, key: &str) -> Result<()> {
        if !self.store.contains(key).await? {
            return Err(VectorError::NotFound(key.to_string()));
        }
        let mut node = self.store.get(key, 0).await?;
        node.deleted = false;
        self.store.set(key, node).await?;
        Ok(())
    }

    /// Move the entry point off a deleted node: walk layers top-down looking
    /// for any live replacement, dropping layers that have none. An index
    /// with no live node left is cleared entirely.
    async fn migrate_entry_point(&mut self, deleted: &str) -> Result<()> {
        loop {
            let (top, keys) = {
                let layers = self.layers.read();
                match layers.last() {
                    Some(layer) => (layers.len() - 1, layer.keys().cloned().collect::<Vec<_>>()),
                    None => break,
                }
            };

            let mut replacement = None;
            for key in keys {
                if key == deleted {
                    continue;
                }
                if !self.store.get(&key, top).await?.deleted {
                    replacement = Some(key);
                    break;
                }
            }

            if let Some(key) = replacement {
                self.entry_point = Some(key);
                return Ok(());
            }
            self.layers.write().pop();
        }

        self.clear().await
    }

    // ---- query ------------------------------------------------------------

    pub(crate) async fn query(&mut self, query: &[f64], k: Option<usize>) -> Result<QueryResult> {
        let Some(entry) = self.entry_point.clone() else {
            return Err(VectorError::NotInitialized);
        };

        let top = self.layers.len() - 1;
        let entry_node = self.store.get(&entry, top).await?;
        if self.dim.is_none() {
            self.note_dimension(entry_node.vector.len());
        }
        if let Some(dim) = self.dim
            && query.len() != dim
        {
            return Err(VectorError::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }

        let mut best = (entry, self.compute(query, &entry_node.vector));
        for layer in (1..=top).rev() {
            best = self.search_layer_ef1(query, best, layer, true).await?;
        }

        // With k omitted every node must come back, so the beam has to be
        // wide enough for the whole of layer 0
        let ef = match k {
            Some(k) => self.config.ef_search.max(k),
            None => self.layers.read()[0].len(),
        };
        let mut found = self
            .search_layer(query, std::slice::from_ref(&best), ef, 0, false)
            .await?;
        if let Some(k) = k {
            found.truncate(k);
        }

        let (keys, distances) = found.into_iter().unzip();
        Ok(QueryResult { keys, distances })
    }

    // ---- compact ----------------------------------------------------------

    /// Rebuild the index from live nodes, dropping soft-deleted ones and
    /// their adjacency. Levels are re-sampled from the same RNG; vectors are
    /// preserved bit for bit.
    pub(crate) async fn compact(&mut self) -> Result<()> {
        let keys = self.store.keys().await?;
        let mut survivors = Vec::with_capacity(keys.len());
        for key in keys {
            let node = self.store.get(&key, 0).await?;
            if !node.deleted {
                survivors.push((key, node.vector));
            }
        }

        debug!(survivors = survivors.len(), "compacting index");
        self.clear().await?;
        for (key, vector) in survivors {
            self.insert(&key, vector, None).await?;
        }
        if self.metadata.is_some() {
            self.save().await?;
        }
        Ok(())
    }

    /// Reset to the empty state, truncating the node store and any persisted
    /// metadata.
    pub(crate) async fn clear(&mut self) -> Result<()> {
        self.layers.write().clear();
        self.entry_point = None;
        self.store.clear().await?;
        self.dirty.clear();
        if self.metadata.is_some() {
            self.save().await?;
        }
        Ok(())
    }

    // ---- persistence ------------------------------------------------------

    /// Rewrite the metadata record. In-memory indexes have nothing to save.
    pub(crate) async fn save(&mut self) -> Result<()> {
        let Some(metadata) = &self.metadata else {
            self.dirty.clear();
            return Ok(());
        };
        let record = self.snapshot();
        let bytes = bincode::serialize(&record)
            .map_err(|e| VectorError::Serialization(e.to_string()))?;
        metadata.put(METADATA_KEY, &bytes).await?;
        self.dirty.clear();
        debug!(layers = record.layers.len(), "saved index metadata");
        Ok(())
    }

    /// Rewrite the metadata record only if something changed since the last
    /// save. The graph topology is cheap relative to the embeddings, which
    /// are persisted as they are written.
    pub(crate) async fn incremental_save(&mut self) -> Result<()> {
        if self.dirty.is_empty() {
            return Ok(());
        }
        self.save().await
    }

    /// Hydrate state from the persisted metadata record, then rebind the
    /// node store's adjacency handle to the loaded layer sequence. Callers
    /// must not release the ready latch before this returns.
    pub(crate) async fn load(&mut self) -> Result<()> {
        let Some(metadata) = &self.metadata else {
            return Ok(());
        };
        match metadata.get(METADATA_KEY).await? {
            None => {
                debug!("no persisted index metadata; starting empty");
            }
            Some(bytes) => match bincode::deserialize::<IndexSnapshot>(&bytes) {
                Ok(record) => self.apply_snapshot(record),
                Err(e) => {
                    warn!(error = %e, "corrupt index metadata; falling back to empty state");
                    self.reset_graph();
                }
            },
        }
        Ok(())
    }

    fn apply_snapshot(&mut self, record: IndexSnapshot) {
        self.config.distance_kind = record.distance_kind;
        self.config.m = record.m;
        self.config.ef_construction = record.ef_construction;
        self.config.m_max_0 = record.m_max_0;
        self.config.ml = record.ml;
        if record.seed != self.config.seed {
            self.config.seed = record.seed;
            self.rng = StdRng::seed_from_u64(record.seed);
        }
        self.entry_point = record.entry_point_key;
        self.layers = SharedLayers::new(record.layers);
        self.store.rebind_layers(self.layers.clone());
        self.dirty.clear();
        debug!(layers = self.layers.len(), "loaded index metadata");
    }

    pub(crate) fn reset_graph(&mut self) {
        self.entry_point = None;
        self.layers = SharedLayers::new(Vec::new());
        self.store.rebind_layers(self.layers.clone());
        self.dirty.clear();
    }

    // ---- search internals -------------------------------------------------

    /// Greedy single-best search within one layer. Deleted nodes are used as
    /// waypoints; unless `can_return_deleted` they never become the running
    /// best.
    async fn search_layer_ef1(
        &mut self,
        query: &[f64],
        entry: (String, f64),
        layer: usize,
        can_return_deleted: bool,
    ) -> Result<(String, f64)> {
        let mut visited: HashSet<String> = HashSet::from([entry.0.clone()]);
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat, u64, String)>> = BinaryHeap::new();
        let mut seq: u64 = 0;
        candidates.push(Reverse((OrderedFloat(entry.1), seq, entry.0.clone())));
        let mut best = entry;

        while let Some(Reverse((OrderedFloat(d), _, current))) = candidates.pop() {
            if d > best.1 {
                break;
            }
            let neighbors: Vec<String> = {
                let layers = self.layers.read();
                layers[layer]
                    .neighbors(&current)
                    .map(|n| n.keys().cloned().collect())
                    .unwrap_or_default()
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let node = self.store.get(&neighbor, layer).await?;
                let nd = self.compute(query, &node.vector);
                if nd < best.1 {
                    if can_return_deleted || !node.deleted {
                        best = (neighbor.clone(), nd);
                    }
                    seq += 1;
                    candidates.push(Reverse((OrderedFloat(nd), seq, neighbor)));
                }
            }
        }
        Ok(best)
    }

    /// Beam search within one layer. Returns up to `ef` nodes sorted by
    /// ascending distance. Deleted nodes keep the beam moving but only enter
    /// the results when `can_return_deleted`.
    async fn search_layer(
        &mut self,
        query: &[f64],
        entries: &[(String, f64)],
        ef: usize,
        layer: usize,
        can_return_deleted: bool,
    ) -> Result<Vec<(String, f64)>> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut candidates: BinaryHeap<Reverse<(OrderedFloat, u64, String)>> = BinaryHeap::new();
        let mut results: BinaryHeap<(OrderedFloat, u64, String)> = BinaryHeap::new();
        let mut seq: u64 = 0;

        for (key, d) in entries {
            if !visited.insert(key.clone()) {
                continue;
            }
            candidates.push(Reverse((OrderedFloat(*d), seq, key.clone())));
            let node = self.store.get(key, layer).await?;
            if can_return_deleted || !node.deleted {
                results.push((OrderedFloat(*d), seq, key.clone()));
            }
            seq += 1;
        }

        while let Some(Reverse((OrderedFloat(d), _, current))) = candidates.pop() {
            if results.len() >= ef
                && let Some((OrderedFloat(worst), _, _)) = results.peek()
                && d > *worst
            {
                break;
            }

            let neighbors: Vec<String> = {
                let layers = self.layers.read();
                layers[layer]
                    .neighbors(&current)
                    .map(|n| n.keys().cloned().collect())
                    .unwrap_or_default()
            };
            for neighbor in neighbors {
                if !visited.insert(neighbor.clone()) {
                    continue;
                }
                let node = self.store.get(&neighbor, layer).await?;
                let nd = self.compute(query, &node.vector);
                let worst = results
                    .peek()
                    .map(|(OrderedFloat(w), _, _)| *w)
                    .unwrap_or(f64::MAX);
                if results.len() < ef || nd < worst {
                    seq += 1;
                    candidates.push(Reverse((OrderedFloat(nd), seq, neighbor.clone())));
                    if can_return_deleted || !node.deleted {
                        results.push((OrderedFloat(nd), seq, neighbor));
                        if results.len() > ef {
                            results.pop();
                        }
                    }
                }
            }
        }

        let mut found: Vec<(String, f64, u64)> = results
            .into_iter()
            .map(|(OrderedFloat(d), s, key)| (key, d, s))
            .collect();
        found.sort_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
        });
        Ok(found.into_iter().map(|(key, d, _)| (key, d)).collect())
    }

    /// Diversity-preserving neighbor selection.
    ///
    /// Candidates carry their distance to the target. Drained nearest-first,
    /// a candidate is kept only if it is no closer to an already selected
    /// neighbor than to the target itself.
    async fn select_neighbors(
        &mut self,
        candidates: Vec<(String, f64)>,
        max_size: usize,
        layer: usize,
    ) -> Result<Vec<(String, f64)>> {
        if candidates.len() < max_size {
            return Ok(candidates);
        }

        let mut heap: BinaryHeap<Reverse<(OrderedFloat, u64, String)>> = BinaryHeap::new();
        for (seq, (key, d)) in candidates.into_iter().enumerate() {
            heap.push(Reverse((OrderedFloat(d), seq as u64, key)));
        }

        let mut selected: Vec<(String, f64)> = Vec::with_capacity(max_size);
        while let Some(Reverse((OrderedFloat(d), _, candidate))) = heap.pop() {
            if selected.len() >= max_size {
                break;
            }
            let mut diverse = true;
            for (kept, _) in &selected {
                if self.distance_between(&candidate, kept, layer).await? < d {
                    diverse = false;
                    break;
                }
            }
            if diverse {
                selected.push((candidate, d));
            }
        }
        Ok(selected)
    }

    // ---- helpers ----------------------------------------------------------

    fn max_links(&self, layer: usize) -> usize {
        if layer == 0 {
            self.config.m_max_0
        } else {
            self.config.m
        }
    }

    fn set_neighbors(&self, layer: usize, key: &str, neighbors: &[(String, f64)]) {
        let map: HashMap<String, f64> = neighbors
            .iter()
            .map(|(k, d)| (k.clone(), *d))
            .collect();
        self.layers.write()[layer].set_neighbors(key, map);
    }

    fn mark_dirty_span(&mut self, key: &str, top: usize) {
        for layer in 0..=top {
            self.dirty.insert((key.to_string(), layer));
        }
    }

    fn check_dim(&mut self, vector: &[f64]) -> Result<()> {
        match self.dim {
            Some(dim) if dim != vector.len() => Err(VectorError::DimensionMismatch {
                expected: dim,
                actual: vector.len(),
            }),
            Some(_) => Ok(()),
            None => {
                self.note_dimension(vector.len());
                Ok(())
            }
        }
    }

    /// First sighting of the embedding dimension: record it and resize the
    /// node cache to the byte budget.
    fn note_dimension(&mut self, dim: usize) {
        self.dim = Some(dim);
        self.store.on_dimension(dim);
    }

    fn random_level(&mut self) -> usize {
        let uniform: f64 = self.rng.random();
        let level = (-uniform.ln() * self.config.ml).floor() as usize;
        level.min(MAX_LEVEL)
    }

    /// Distance between the query vector and nothing else: query vectors
    /// have no stable key and always bypass the distance cache.
    fn compute(&self, a: &[f64], b: &[f64]) -> f64 {
        let d = match (&self.config.distance_kind, &self.config.custom_distance) {
            (DistanceKind::Custom, Some(f)) => (f.0)(a, b),
            (DistanceKind::Custom, None) | (DistanceKind::Cosine, _) => distance::cosine(a, b),
            (DistanceKind::CosinePrenormalized, _) => distance::cosine_prenormalized(a, b),
        };
        distance::round_to(d, self.config.distance_precision)
    }

    /// Distance between two stored nodes, eligible for memoization when the
    /// distance cache is enabled (never for custom distances).
    async fn distance_between(&mut self, a: &str, b: &str, layer: usize) -> Result<f64> {
        let cacheable = self.config.distance_kind != DistanceKind::Custom;
        if cacheable && let Some(d) = self.distance_cache.get(a, b) {
            return Ok(d);
        }
        let va = self.store.get(a, layer).await?.vector;
        let vb = self.store.get(b, layer).await?.vector;
        let d = self.compute(&va, &vb);
        if cacheable {
            self.distance_cache.put(a, b, d);
        }
        Ok(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = HnswConfig::default();
        assert_eq!(config.m, 16);
        assert_eq!(config.m_max_0, 32);
        assert_eq!(config.ef_construction, 100);
        assert_eq!(config.distance_precision, 6);
        assert_eq!(config.distance_kind, DistanceKind::CosinePrenormalized);
        assert!(config.use_persistence);
        assert!(!config.clear_on_init);
        assert!(!config.autosave_enabled);
        assert_eq!(config.autosave_delay_ms, 5000);
    }

    #[test]
    fn test_config_presets() {
        assert_eq!(HnswConfig::fast().m, 8);
        assert_eq!(HnswConfig::balanced().m, 16);
        assert_eq!(HnswConfig::high_quality().ef_construction, 400);
    }

    #[test]
    fn test_level_sampling_deterministic_under_seed() {
        let config = HnswConfig {
            seed: 42,
            ..HnswConfig::default()
        };
        let mut a = HnswCore::new(
            config.clone(),
            SharedLayers::default(),
            NodeStore::Memory(crate::store::MemoryNodeStore::new()),
            None,
        );
        let mut b = HnswCore::new(
            config,
            SharedLayers::default(),
            NodeStore::Memory(crate::store::MemoryNodeStore::new()),
            None,
        );
        let levels_a: Vec<usize> = (0..64).map(|_| a.random_level()).collect();
        let levels_b: Vec<usize> = (0..64).map(|_| b.random_level()).collect();
        assert_eq!(levels_a, levels_b);
        assert!(levels_a.iter().all(|&l| l <= MAX_LEVEL));
    }

    #[test]
    fn test_snapshot_roundtrip_structural_equality() {
        let mut layer = GraphLayer::default();
        layer.set_neighbors("a", HashMap::from([("b".to_string(), 0.25)]));
        let record = IndexSnapshot {
            distance_kind: DistanceKind::CosinePrenormalized,
            m: 16,
            ef_construction: 100,
            m_max_0: 32,
            ml: 0.36,
            seed: 7,
            use_persistence: true,
            entry_point_key: Some("a".to_string()),
            layers: vec![layer],
        };

        let bytes = bincode::serialize(&record).unwrap();
        let decoded: IndexSnapshot = bincode::deserialize(&bytes).unwrap();
        assert_eq!(record, decoded);
    }
}
