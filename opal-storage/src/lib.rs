//! Storage Engine Implementation
//!
//! This module implements the persistence layer of OpalDB on top of an
//! embedded RocksDB instance. Higher layers address it through logical
//! tables, each table mapping to a key prefix in the shared keyspace.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("RocksDB error: {0}")]
    RocksDB(#[from] rocksdb::Error),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, Error>;

mod engine;
mod table;

pub use engine::StorageEngine;
pub use table::Table;
