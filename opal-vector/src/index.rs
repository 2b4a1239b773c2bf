//! Public vector index handle
//!
//! [`VectorIndex`] wraps the HNSW core behind a single async mutex so that
//! mutations, queries, compaction and the autosave timer all serialize.
//! Persistent indexes start an asynchronous metadata load at construction;
//! every public operation first awaits the ready latch, which is released
//! only after the loaded layer sequence has been rebound into the node
//! store.

use crate::graph::SharedLayers;
use crate::hnsw::{DirtyStats, HnswCore, HnswConfig, IndexSnapshot, IndexStats, QueryResult};
use crate::store::{MemoryNodeStore, NodeStore, PersistentNodeStore};
use crate::{Result, VectorError};
use opal_storage::{StorageEngine, Table};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::warn;

/// Name of the logical table holding the index metadata record.
const METADATA_TABLE: &str = "metadata";

/// An HNSW vector index over string-keyed embeddings.
pub struct VectorIndex {
    core: Arc<Mutex<HnswCore>>,
    /// Held so the ready channel stays open for the index's lifetime.
    _ready_tx: Arc<watch::Sender<bool>>,
    ready_rx: watch::Receiver<bool>,
    autosave_enabled: Arc<AtomicBool>,
    autosave_delay: Duration,
    autosave_task: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl VectorIndex {
    /// Create an index that keeps everything in memory.
    pub fn in_memory(config: HnswConfig) -> Self {
        let layers = SharedLayers::default();
        let store = NodeStore::Memory(MemoryNodeStore::new());
        let core = HnswCore::new(config.clone(), layers, store, None);
        let (ready_tx, ready_rx) = watch::channel(true);
        Self {
            core: Arc::new(Mutex::new(core)),
            _ready_tx: Arc::new(ready_tx),
            ready_rx,
            autosave_enabled: Arc::new(AtomicBool::new(config.autosave_enabled)),
            autosave_delay: Duration::from_millis(config.autosave_delay_ms),
            autosave_task: Arc::new(StdMutex::new(None)),
        }
    }

    /// Create an index backed by the storage engine.
    ///
    /// Construction returns immediately; a background task either loads the
    /// persisted metadata or, with `clear_on_init`, truncates the persisted
    /// state. Operations invoked before that finishes wait on [`ready`].
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// [`ready`]: VectorIndex::ready
    pub fn open(config: HnswConfig, engine: Arc<StorageEngine>) -> Self {
        if !config.use_persistence {
            return Self::in_memory(config);
        }

        let layers = SharedLayers::default();
        let store = NodeStore::Persistent(PersistentNodeStore::new(
            engine.clone(),
            layers.clone(),
            config.target_cache_bytes,
            config.prefetch_size_override,
        ));
        let metadata = Table::new(engine, METADATA_TABLE);
        let core = Arc::new(Mutex::new(HnswCore::new(
            config.clone(),
            layers,
            store,
            Some(metadata),
        )));

        let (ready_tx, ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);

        let init_core = core.clone();
        let init_tx = ready_tx.clone();
        let clear_on_init = config.clear_on_init;
        tokio::spawn(async move {
            let mut core = init_core.lock().await;
            let result = if clear_on_init {
                core.clear().await
            } else {
                core.load().await
            };
            if let Err(e) = result {
                warn!(error = %e, "index initialization failed; starting empty");
                core.reset_graph();
            }
            drop(core);
            let _ = init_tx.send(true);
        });

        Self {
            core,
            _ready_tx: ready_tx,
            ready_rx,
            autosave_enabled: Arc::new(AtomicBool::new(config.autosave_enabled)),
            autosave_delay: Duration::from_millis(config.autosave_delay_ms),
            autosave_task: Arc::new(StdMutex::new(None)),
        }
    }

    /// Wait until any deferred initialization has finished.
    pub async fn ready(&self) -> Result<()> {
        let mut rx = self.ready_rx.clone();
        rx.wait_for(|ready| *ready)
            .await
            .map_err(|_| VectorError::Index("initialization task aborted".to_string()))?;
        Ok(())
    }

    /// Insert a new vector. Fails with [`VectorError::Duplicate`] if the key
    /// is live; a soft-deleted key is revived with the new vector instead.
    pub async fn insert(&self, key: &str, vector: Vec<f64>, level: Option<usize>) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.insert(key, vector, level).await?;
        self.schedule_autosave();
        Ok(())
    }

    /// Insert a batch of vectors, stopping at the first failure.
    pub async fn bulk_insert(&self, entries: Vec<(String, Vec<f64>)>) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.bulk_insert(entries).await?;
        self.schedule_autosave();
        Ok(())
    }

    /// Replace a stored vector and repair the surrounding neighborhoods.
    pub async fn update(&self, key: &str, vector: Vec<f64>) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.update(key, vector).await?;
        self.schedule_autosave();
        Ok(())
    }

    /// Soft-delete a key: invisible to queries, still a traversal waypoint.
    pub async fn mark_deleted(&self, key: &str) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.mark_deleted(key).await?;
        self.schedule_autosave();
        Ok(())
    }

    /// Clear a key's soft-delete flag.
    pub async fn unmark_deleted(&self, key: &str) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.unmark_deleted(key).await?;
        self.schedule_autosave();
        Ok(())
    }

    /// Find the `k` nearest live nodes (all of them if `k` is `None`).
    pub async fn query(&self, query: &[f64], k: Option<usize>) -> Result<QueryResult> {
        self.ready().await?;
        self.core.lock().await.query(query, k).await
    }

    /// Rebuild the index from live nodes, physically dropping soft-deleted
    /// ones.
    pub async fn compact(&self) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.compact().await
    }

    /// Rewrite the persisted metadata record unconditionally.
    pub async fn save(&self) -> Result<()> {
        self.ready().await?;
        self.cancel_autosave();
        self.core.lock().await.save().await
    }

    /// Rewrite the persisted metadata record only if there are unsaved
    /// mutations.
    pub async fn incremental_save(&self) -> Result<()> {
        self.ready().await?;
        self.cancel_autosave();
        self.core.lock().await.incremental_save().await
    }

    /// Re-hydrate state from the persisted metadata record.
    pub async fn load(&self) -> Result<()> {
        self.ready().await?;
        self.core.lock().await.load().await
    }

    /// Drop every node and layer, truncating persisted state.
    pub async fn clear(&self) -> Result<()> {
        self.ready().await?;
        self.cancel_autosave();
        self.core.lock().await.clear().await
    }

    /// Whether the key exists at all, live or soft-deleted.
    pub async fn contains(&self, key: &str) -> Result<bool> {
        self.ready().await?;
        self.core.lock().await.contains(key).await
    }

    /// Whether the key exists and is not soft-deleted.
    pub async fn is_live(&self, key: &str) -> Result<bool> {
        self.ready().await?;
        self.core.lock().await.is_live(key).await
    }

    pub async fn is_empty(&self) -> Result<bool> {
        self.ready().await?;
        Ok(self.core.lock().await.is_empty())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        self.ready().await?;
        self.core.lock().await.stats().await
    }

    pub async fn dirty_stats(&self) -> Result<DirtyStats> {
        self.ready().await?;
        Ok(self.core.lock().await.dirty_stats())
    }

    /// Export the metadata record that [`save`] would persist.
    ///
    /// [`save`]: VectorIndex::save
    pub async fn export(&self) -> Result<IndexSnapshot> {
        self.ready().await?;
        Ok(self.core.lock().await.snapshot())
    }

    /// Toggle debounced autosave. Disabling cancels any pending timer
    /// without firing it.
    pub fn set_autosave(&self, enabled: bool) {
        self.autosave_enabled.store(enabled, Ordering::Relaxed);
        if !enabled {
            self.cancel_autosave();
        }
    }

    /// Arm (or re-arm) the one-shot autosave timer. Rapid mutations keep
    /// pushing the deadline out; the eventual firing runs an incremental
    /// save under the index lock, retrying on failure with the dirty flags
    /// intact.
    fn schedule_autosave(&self) {
        if !self.autosave_enabled.load(Ordering::Relaxed) {
            return;
        }
        let mut pending = self
            .autosave_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(task) = pending.take() {
            task.abort();
        }
        let core = self.core.clone();
        let delay = self.autosave_delay;
        *pending = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                match core.lock().await.incremental_save().await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(error = %e, "autosave failed; dirty flags retained");
                    }
                }
            }
        }));
    }

    fn cancel_autosave(&self) {
        let mut pending = self
            .autosave_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(task) = pending.take() {
            task.abort();
        }
    }
}

impl Drop for VectorIndex {
    fn drop(&mut self) {
        self.cancel_autosave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(x: f64, y: f64, z: f64) -> Vec<f64> {
        crate::distance::normalized(&[x, y, z])
    }

    fn test_config() -> HnswConfig {
        HnswConfig {
            seed: 42,
            use_persistence: false,
            ..HnswConfig::default()
        }
    }

    #[tokio::test]
    async fn test_insert_and_query_nearest() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), None).await.unwrap();

        let result = index.query(&unit(1.0, 0.0, 0.0), Some(1)).await.unwrap();
        assert_eq!(result.keys, vec!["a".to_string()]);
        assert!(result.distances[0] < 1e-6);
    }

    #[tokio::test]
    async fn test_duplicate_insert_rejected() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        let err = index
            .insert("a", unit(1.0, 0.0, 0.0), None)
            .await
            .unwrap_err();
        assert!(matches!(err, VectorError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_insert_revives_soft_deleted_key() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), None).await.unwrap();
        index.mark_deleted("a").await.unwrap();

        // Re-insert of a deleted key succeeds and replaces the vector
        index.insert("a", unit(0.0, 0.0, 1.0), None).await.unwrap();

        let result = index.query(&unit(0.0, 0.0, 1.0), Some(1)).await.unwrap();
        assert_eq!(result.keys, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_dimension_mismatch() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", vec![1.0, 0.0, 0.0], None).await.unwrap();
        let err = index.insert("b", vec![1.0, 0.0], None).await.unwrap_err();
        assert!(matches!(
            err,
            VectorError::DimensionMismatch {
                expected: 3,
                actual: 2
            }
        ));

        let err = index.query(&[1.0], Some(1)).await.unwrap_err();
        assert!(matches!(err, VectorError::DimensionMismatch { .. }));
    }

    #[tokio::test]
    async fn test_query_empty_index() {
        let index = VectorIndex::in_memory(test_config());
        let err = index.query(&[1.0, 0.0, 0.0], Some(1)).await.unwrap_err();
        assert!(matches!(err, VectorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_deleted_nodes_excluded_from_results() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), None).await.unwrap();
        index.insert("c", unit(0.0, 0.0, 1.0), None).await.unwrap();
        index.mark_deleted("b").await.unwrap();

        let result = index.query(&unit(0.0, 1.0, 0.0), Some(3)).await.unwrap();
        assert!(!result.keys.contains(&"b".to_string()));
        assert!(result.keys.iter().all(|k| k == "a" || k == "c"));
    }

    #[tokio::test]
    async fn test_unmark_deleted_restores_visibility() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), None).await.unwrap();

        index.mark_deleted("b").await.unwrap();
        index.unmark_deleted("b").await.unwrap();

        let result = index.query(&unit(0.0, 1.0, 0.0), Some(1)).await.unwrap();
        assert_eq!(result.keys, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_mark_deleted_absent_key() {
        let index = VectorIndex::in_memory(test_config());
        let err = index.mark_deleted("ghost").await.unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_mark_deleted_dirties_only_occupied_layers() {
        let index = VectorIndex::in_memory(test_config());

        // "a" spans layers 0..=2 and is the entry point; "b" sits in layer 0
        index.insert("a", unit(1.0, 0.0, 0.0), Some(2)).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), Some(0)).await.unwrap();
        index.save().await.unwrap();

        index.mark_deleted("b").await.unwrap();

        let dirty = index.dirty_stats().await.unwrap();
        assert_eq!(dirty.dirty_nodes, 1);
        assert_eq!(dirty.dirty_entries, 1);
    }

    #[tokio::test]
    async fn test_entry_point_migration() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), None).await.unwrap();

        // Whichever node is the entry point, deleting both must leave the
        // index empty; deleting one must keep it queryable.
        index.mark_deleted("a").await.unwrap();
        let result = index.query(&unit(0.0, 1.0, 0.0), Some(2)).await.unwrap();
        assert_eq!(result.keys, vec!["b".to_string()]);

        index.mark_deleted("b").await.unwrap();
        assert!(index.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_update_moves_node() {
        let index = VectorIndex::in_memory(test_config());

        index.insert("a", unit(1.0, 0.0, 0.0), None).await.unwrap();
        index.insert("b", unit(0.0, 1.0, 0.0), None).await.unwrap();
        index.insert("c", unit(0.0, 0.0, 1.0), None).await.unwrap();

        index.update("a", unit(0.1, 0.1, 0.9)).await.unwrap();

        let result = index.query(&unit(0.0, 0.0, 1.0), Some(2)).await.unwrap();
        assert!(result.keys.contains(&"a".to_string()));
        assert!(result.keys.contains(&"c".to_string()));
    }

    #[tokio::test]
    async fn test_update_absent_key() {
        let index = VectorIndex::in_memory(test_config());
        let err = index.update("ghost", vec![1.0]).await.unwrap_err();
        assert!(matches!(err, VectorError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_bulk_insert_and_stats() {
        let index = VectorIndex::in_memory(test_config());

        let entries: Vec<(String, Vec<f64>)> = (0..10)
            .map(|i| {
                let angle = i as f64 * 0.3;
                (format!("n{i}"), unit(angle.cos(), angle.sin(), 0.5))
            })
            .collect();
        index.bulk_insert(entries).await.unwrap();

        for i in 0..5 {
            index.mark_deleted(&format!("n{i}")).await.unwrap();
        }

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_nodes, 10);
        assert_eq!(stats.active_nodes, 5);
        assert_eq!(stats.deleted_nodes, 5);
    }

    #[tokio::test]
    async fn test_compact_drops_deleted_nodes() {
        let index = VectorIndex::in_memory(test_config());

        let entries: Vec<(String, Vec<f64>)> = (0..10)
            .map(|i| {
                let angle = i as f64 * 0.3;
                (format!("n{i}"), unit(angle.cos(), angle.sin(), 0.5))
            })
            .collect();
        let vectors: Vec<Vec<f64>> = entries.iter().map(|(_, v)| v.clone()).collect();
        index.bulk_insert(entries).await.unwrap();

        for i in 0..5 {
            index.mark_deleted(&format!("n{i}")).await.unwrap();
        }
        index.compact().await.unwrap();

        let stats = index.stats().await.unwrap();
        assert_eq!(stats.total_nodes, 5);
        assert_eq!(stats.active_nodes, 5);
        assert_eq!(stats.deleted_nodes, 0);

        // Every survivor still resolves as its own nearest neighbor
        for i in 5..10 {
            let result = index.query(&vectors[i], Some(1)).await.unwrap();
            assert_eq!(result.keys, vec![format!("n{i}")]);
        }
    }

    #[tokio::test]
    async fn test_neighbor_caps_hold() {
        let config = HnswConfig {
            m: 4,
            m_max_0: 8,
            ..test_config()
        };
        let index = VectorIndex::in_memory(config);

        for i in 0..60 {
            let angle = i as f64 * 0.11;
            let vector = unit(angle.cos(), angle.sin(), (i as f64 * 0.05).sin());
            index.insert(&format!("n{i}"), vector, None).await.unwrap();
        }

        let snapshot = index.export().await.unwrap();
        for (layer_idx, layer) in snapshot.layers.iter().enumerate() {
            let cap = if layer_idx == 0 { 8 } else { 4 };
            for key in layer.keys() {
                let count = layer.neighbors(key).map(|n| n.len()).unwrap_or(0);
                assert!(
                    count <= cap,
                    "layer {layer_idx} node {key} has {count} neighbors (cap {cap})"
                );
            }
        }
    }

    #[tokio::test]
    async fn test_query_all_when_k_omitted() {
        // ef_search far below the node count: an omitted k must still
        // return every live node
        let config = HnswConfig {
            ef_search: 4,
            ..test_config()
        };
        let index = VectorIndex::in_memory(config);

        for i in 0..12 {
            let angle = i as f64 * 0.47;
            let vector = unit(angle.cos(), angle.sin(), (i as f64 * 0.09).cos());
            index.insert(&format!("n{i}"), vector, None).await.unwrap();
        }

        let result = index.query(&unit(1.0, 0.0, 0.0), None).await.unwrap();
        assert_eq!(result.keys.len(), 12);
        // Ascending by distance
        for pair in result.distances.windows(2) {
            assert!(pair[0] <= pair[1]);
        }

        // An explicit k stays capped
        let result = index.query(&unit(1.0, 0.0, 0.0), Some(5)).await.unwrap();
        assert_eq!(result.keys.len(), 5);
    }

    #[tokio::test]
    async fn test_custom_distance() {
        use crate::distance::{DistanceFn, DistanceKind};
        use std::sync::Arc as StdArc;

        let config = HnswConfig {
            distance_kind: DistanceKind::Custom,
            custom_distance: Some(DistanceFn(StdArc::new(|a: &[f64], b: &[f64]| {
                a.iter()
                    .zip(b.iter())
                    .map(|(x, y)| (x - y).abs())
                    .sum::<f64>()
            }))),
            ..test_config()
        };
        let index = VectorIndex::in_memory(config);

        index.insert("a", vec![0.0, 0.0], None).await.unwrap();
        index.insert("b", vec![5.0, 5.0], None).await.unwrap();

        let result = index.query(&[0.2, 0.1], Some(1)).await.unwrap();
        assert_eq!(result.keys, vec!["a".to_string()]);
    }
}
