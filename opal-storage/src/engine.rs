use crate::Result;
use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch};
use std::path::{Path, PathBuf};

/// Embedded storage engine backed by RocksDB.
///
/// All methods are declared async so callers can treat reads and writes as
/// suspension points; RocksDB itself performs the I/O synchronously.
pub struct StorageEngine {
    db: DB,
    path: PathBuf,
}

impl StorageEngine {
    /// Open (or create) a storage engine at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_buf = path.as_ref().to_path_buf();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, &path_buf)?;

        Ok(Self { db, path: path_buf })
    }

    /// Get a value by key.
    pub async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key)?)
    }

    /// Put a key-value pair.
    pub async fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.put(key, value)?;
        Ok(())
    }

    /// Delete a key.
    pub async fn delete(&self, key: &[u8]) -> Result<()> {
        self.db.delete(key)?;
        Ok(())
    }

    /// Write a batch of key-value pairs atomically.
    pub async fn put_batch(&self, entries: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (key, value) in entries {
            batch.put(key, value);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Read many keys in one pass, preserving request order.
    ///
    /// Missing keys yield `None` placeholders.
    pub async fn multi_get(&self, keys: &[Vec<u8>]) -> Result<Vec<Option<Vec<u8>>>> {
        let mut values = Vec::with_capacity(keys.len());
        for result in self.db.multi_get(keys) {
            values.push(result?);
        }
        Ok(values)
    }

    /// Return every key-value pair whose key starts with `prefix`.
    pub async fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut entries = Vec::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            entries.push((key.to_vec(), value.to_vec()));
        }
        Ok(entries)
    }

    /// Count the keys under a prefix.
    pub async fn count_prefix(&self, prefix: &[u8]) -> Result<usize> {
        let mut count = 0;
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            count += 1;
        }
        Ok(count)
    }

    /// Delete every key under a prefix.
    pub async fn clear_prefix(&self, prefix: &[u8]) -> Result<()> {
        let mut batch = WriteBatch::default();
        let iter = self
            .db
            .iterator(IteratorMode::From(prefix, Direction::Forward));
        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(prefix) {
                break;
            }
            batch.delete(key);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Get the storage path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}
