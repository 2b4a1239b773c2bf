//! Search manager: document CRUD and semantic search
//!
//! Orchestrates the embedder, the content store and the vector index. The
//! content store is authoritative for text, the index for vectors; ids tie
//! the two together. Partial failures can leave the stores diverged, which
//! compaction tolerates.

use crate::content::{ContentRecord, ContentStore};
use crate::embedder::Embedder;
use crate::{Result, SearchError};
use opal_storage::StorageEngine;
use opal_vector::{HnswConfig, IndexStats, VectorIndex};
use std::sync::Arc;
use tracing::debug;

/// Configuration for the search manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Vector index configuration
    pub index: HnswConfig,
    /// Name of the storage table holding document content
    pub content_store_name: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            index: HnswConfig::default(),
            content_store_name: "content".to_string(),
        }
    }
}

/// A document joined back out of the content store and the index.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentRecord {
    pub id: String,
    pub text: String,
    pub metadata: Option<serde_json::Value>,
}

/// One search result: the document, its distance to the query and the
/// derived similarity (`1 - distance`).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub key: String,
    pub text: String,
    pub distance: f64,
    pub similarity: f64,
    pub metadata: Option<serde_json::Value>,
}

/// Document-level interface over embedder + content store + vector index.
pub struct SearchManager {
    embedder: Arc<dyn Embedder>,
    content: ContentStore,
    index: VectorIndex,
}

impl SearchManager {
    /// Create a manager over the given storage engine.
    ///
    /// The index follows its own `use_persistence` setting; document content
    /// is always persisted.
    pub fn new(
        embedder: Arc<dyn Embedder>,
        engine: Arc<StorageEngine>,
        config: ManagerConfig,
    ) -> Self {
        let content = ContentStore::new(engine.clone(), &config.content_store_name);
        let index = VectorIndex::open(config.index, engine);
        Self {
            embedder,
            content,
            index,
        }
    }

    /// Embed and store a document. Returns its id (caller-supplied, or a
    /// freshly generated token).
    pub async fn add(
        &self,
        text: &str,
        id: Option<String>,
        metadata: Option<serde_json::Value>,
    ) -> Result<String> {
        let vector = self.embed(text).await?;
        let id = id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        self.content.put(&id, text, metadata).await?;
        self.index.insert(&id, vector, None).await?;
        debug!(id = %id, "added document");
        Ok(id)
    }

    /// Re-embed a document with new text. Existing metadata is kept.
    pub async fn update(&self, id: &str, new_text: &str) -> Result<()> {
        let record = self
            .content
            .get(id)
            .await?
            .ok_or_else(|| SearchError::NotFound(id.to_string()))?;

        let vector = self.embed(new_text).await?;
        self.content.put(id, new_text, record.metadata).await?;
        self.index.update(id, vector).await?;
        Ok(())
    }

    /// Remove a document: soft-delete in the index, hard-delete the text.
    pub async fn delete(&self, id: &str) -> Result<()> {
        if self.content.get(id).await?.is_none() {
            return Err(SearchError::NotFound(id.to_string()));
        }
        self.index.mark_deleted(id).await?;
        self.content.delete(id).await?;
        debug!(id = %id, "deleted document");
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<DocumentRecord>> {
        Ok(self.content.get(id).await?.map(|record| DocumentRecord {
            id: id.to_string(),
            text: record.text,
            metadata: record.metadata,
        }))
    }

    /// Whether the document exists with a live index entry.
    pub async fn has(&self, id: &str) -> Result<bool> {
        if self.content.get(id).await?.is_none() {
            return Ok(false);
        }
        Ok(self.index.is_live(id).await?)
    }

    /// Semantic search: embed the query, find the nearest documents, join
    /// them with their text. Ids missing from the content store are dropped.
    pub async fn search(&self, query_text: &str, k: usize) -> Result<Vec<SearchHit>> {
        let vector = self.embed(query_text).await?;
        if self.index.is_empty().await? {
            return Ok(Vec::new());
        }

        let result = self.index.query(&vector, Some(k)).await?;
        let records = self.content.bulk_get(&result.keys).await?;

        let hits = result
            .keys
            .into_iter()
            .zip(result.distances)
            .zip(records)
            .filter_map(|((key, distance), record)| {
                record.map(|ContentRecord { text, metadata }| SearchHit {
                    key,
                    text,
                    distance,
                    similarity: 1.0 - distance,
                    metadata,
                })
            })
            .collect();
        Ok(hits)
    }

    /// Rebuild the index from live nodes. Content is unaffected.
    pub async fn compact(&self) -> Result<()> {
        self.index.compact().await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<IndexStats> {
        Ok(self.index.stats().await?)
    }

    /// The underlying vector index.
    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    /// The underlying content store.
    pub fn content(&self) -> &ContentStore {
        &self.content
    }

    async fn embed(&self, text: &str) -> Result<Vec<f64>> {
        self.embedder
            .embed(text)
            .await
            .map_err(|e| SearchError::EmbedFailed(e.to_string()))
    }
}
