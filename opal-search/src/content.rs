//! Content store: authoritative storage for document text
//!
//! The vector index owns embeddings; this table owns the original text and
//! the free-form metadata bag that travels with it.

use crate::Result;
use opal_storage::{StorageEngine, Table};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A stored document: text plus an optional metadata bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRecord {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Persisted id -> content mapping over a named storage table.
#[derive(Clone)]
pub struct ContentStore {
    table: Table,
}

impl ContentStore {
    pub fn new(engine: Arc<StorageEngine>, name: &str) -> Self {
        Self {
            table: Table::new(engine, name),
        }
    }

    /// Upsert a document.
    pub async fn put(
        &self,
        id: &str,
        text: &str,
        metadata: Option<serde_json::Value>,
    ) -> Result<()> {
        let record = ContentRecord {
            text: text.to_string(),
            metadata,
        };
        let bytes = serde_json::to_vec(&record)?;
        self.table.put(id, &bytes).await?;
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.table.delete(id).await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<ContentRecord>> {
        match self.table.get(id).await? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Fetch many documents, preserving request order with `None`
    /// placeholders for missing ids.
    pub async fn bulk_get(&self, ids: &[String]) -> Result<Vec<Option<ContentRecord>>> {
        let values = self.table.multi_get(ids).await?;
        values
            .into_iter()
            .map(|value| match value {
                Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
                None => Ok(None),
            })
            .collect()
    }

    pub async fn get_all(&self) -> Result<Vec<(String, ContentRecord)>> {
        let entries = self.table.scan().await?;
        entries
            .into_iter()
            .map(|(id, bytes)| Ok((id, serde_json::from_slice(&bytes)?)))
            .collect()
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.table.count().await?)
    }

    pub async fn clear(&self) -> Result<()> {
        self.table.clear().await?;
        Ok(())
    }
}
