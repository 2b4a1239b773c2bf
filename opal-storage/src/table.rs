use crate::{Error, Result, StorageEngine};
use std::sync::Arc;

/// A logical table inside the shared keyspace.
///
/// A table named `nodes` owns every key of the form `nodes/<id>`. Record ids
/// are UTF-8 strings and must not contain the separator.
#[derive(Clone)]
pub struct Table {
    engine: Arc<StorageEngine>,
    prefix: Vec<u8>,
}

impl Table {
    pub fn new(engine: Arc<StorageEngine>, name: &str) -> Self {
        let prefix = format!("{name}/").into_bytes();
        Self { engine, prefix }
    }

    fn key(&self, id: &str) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.extend_from_slice(id.as_bytes());
        key
    }

    fn strip(&self, key: &[u8]) -> Result<String> {
        let id = &key[self.prefix.len()..];
        String::from_utf8(id.to_vec())
            .map_err(|e| Error::Storage(format!("non-utf8 record id: {e}")))
    }

    pub async fn get(&self, id: &str) -> Result<Option<Vec<u8>>> {
        self.engine.get(&self.key(id)).await
    }

    pub async fn put(&self, id: &str, value: &[u8]) -> Result<()> {
        self.engine.put(&self.key(id), value).await
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        self.engine.delete(&self.key(id)).await
    }

    pub async fn put_many(&self, entries: &[(String, Vec<u8>)]) -> Result<()> {
        let batch: Vec<(Vec<u8>, Vec<u8>)> = entries
            .iter()
            .map(|(id, value)| (self.key(id), value.clone()))
            .collect();
        self.engine.put_batch(&batch).await
    }

    /// Read many records in one pass, preserving request order with `None`
    /// placeholders for missing ids.
    pub async fn multi_get(&self, ids: &[String]) -> Result<Vec<Option<Vec<u8>>>> {
        let keys: Vec<Vec<u8>> = ids.iter().map(|id| self.key(id)).collect();
        self.engine.multi_get(&keys).await
    }

    pub async fn scan(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let entries = self.engine.scan_prefix(&self.prefix).await?;
        entries
            .into_iter()
            .map(|(key, value)| Ok((self.strip(&key)?, value)))
            .collect()
    }

    pub async fn keys(&self) -> Result<Vec<String>> {
        let entries = self.engine.scan_prefix(&self.prefix).await?;
        entries.iter().map(|(key, _)| self.strip(key)).collect()
    }

    pub async fn count(&self) -> Result<usize> {
        self.engine.count_prefix(&self.prefix).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.engine.clear_prefix(&self.prefix).await
    }
}
