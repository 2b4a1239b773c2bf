//! Vector Search Module for OpalDB
//!
//! This module provides approximate nearest neighbor search over an HNSW
//! (Hierarchical Navigable Small World) graph with soft-delete semantics.
//! Node embeddings live in a pluggable node store: fully in memory, or
//! persisted in the OpalDB storage layer behind an LRU cache with a
//! graph-driven prefetcher.
//!
//! # Features
//!
//! - **HNSW Indexing**: layered proximity graph with a diversity-preserving
//!   neighbor selection heuristic
//! - **Soft deletes**: deleted nodes stay traversable but never surface in
//!   results; `compact` reclaims them
//! - **Persistence**: incremental, dirty-tracked metadata saves with an
//!   optional debounced autosave timer
//! - **Bounded memory**: node embeddings are cached under a fixed byte
//!   budget and prefetched along graph edges
//!
//! # Example
//!
//! ```rust,no_run
//! use opal_vector::{HnswConfig, VectorIndex};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let index = VectorIndex::in_memory(HnswConfig::default());
//!
//! index.insert("a", vec![1.0, 0.0, 0.0], None).await?;
//! index.insert("b", vec![0.0, 1.0, 0.0], None).await?;
//!
//! let result = index.query(&[1.0, 0.0, 0.0], Some(1)).await?;
//! assert_eq!(result.keys, vec!["a".to_string()]);
//! # Ok(())
//! # }
//! ```

mod distance;
mod graph;
mod hnsw;
mod index;
mod lru;
mod store;

pub use distance::{
    DistanceFn, DistanceKind, cosine, cosine_prenormalized, dot_product, magnitude, normalize,
    normalized, round_to,
};
pub use graph::GraphLayer;
pub use hnsw::{DirtyStats, HnswConfig, IndexSnapshot, IndexStats, QueryResult};
pub use index::VectorIndex;
pub use lru::LruCache;
pub use store::{MemoryNodeStore, Node, NodeStore, PersistentNodeStore};

/// Errors that can occur during vector index operations
#[derive(Debug, thiserror::Error)]
pub enum VectorError {
    #[error("duplicate key: {0}")]
    Duplicate(String),

    #[error("key not found: {0}")]
    NotFound(String),

    #[error("index is empty")]
    NotInitialized,

    #[error("invalid vector dimension: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("node missing from store after prefetch: {0}")]
    MissingNode(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] opal_storage::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("index error: {0}")]
    Index(String),
}

pub type Result<T> = std::result::Result<T, VectorError>;
