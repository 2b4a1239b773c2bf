//! Document-level semantic search for OpalDB
//!
//! Couples an external [`Embedder`] with the content store (authoritative
//! for text) and the vector index (authoritative for embeddings). Documents
//! go in as text; search comes back as text plus similarity.
//!
//! # Example
//!
//! ```rust,no_run
//! use opal_search::{ManagerConfig, SearchManager};
//! # use opal_search::{EmbedError, Embedder};
//! # use std::sync::Arc;
//! # struct MyEmbedder;
//! # #[async_trait::async_trait]
//! # impl Embedder for MyEmbedder {
//! #     async fn embed(&self, _text: &str) -> Result<Vec<f64>, EmbedError> {
//! #         Ok(vec![1.0, 0.0])
//! #     }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = Arc::new(opal_storage::StorageEngine::new("./data")?);
//! let manager = SearchManager::new(
//!     Arc::new(MyEmbedder),
//!     engine,
//!     ManagerConfig::default(),
//! );
//!
//! let id = manager.add("the quick brown fox", None, None).await?;
//! let hits = manager.search("fast fox", 3).await?;
//! # Ok(())
//! # }
//! ```

mod content;
mod embedder;
mod manager;

pub use content::{ContentRecord, ContentStore};
pub use embedder::{EmbedError, Embedder, ProgressFn};
pub use manager::{DocumentRecord, ManagerConfig, SearchHit, SearchManager};

/// Errors that can occur during document operations
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("embedding failed: {0}")]
    EmbedFailed(String),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("vector index error: {0}")]
    Vector(#[from] opal_vector::VectorError),

    #[error("storage error: {0}")]
    Storage(#[from] opal_storage::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SearchError>;
