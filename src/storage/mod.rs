// src/storage/mod.rs
// RocksDB-backed persistent storage

pub mod block_store;
pub mod chain_store;
pub mod state_store;
pub mod wal;

pub use block_store::BlockStore;
pub use chain_store::{ChainStore, CommitOutcome, TxReceipt};
pub use state_store::{AccountState, StateStore};
pub use wal::{CommitLog, WalRecord};

use rocksdb::{Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::thread::sleep;
use std::time::Duration;
use thiserror::Error;

use crate::error::ErrorKind;

/// Type alias for RocksDB (Arc for cheap cloning)
pub type RocksDb = Arc<DB>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("non-sequential height: expected {expected}, got {got}")]
    NonSequentialHeight { expected: u64, got: u64 },

    #[error("height {0} already indexed")]
    HeightExists(u64),

    #[error("block hash {0} already indexed")]
    HashExists(String),

    #[error("parent mismatch at height {height}: expected {expected}, got {got}")]
    ParentMismatch {
        height: u64,
        expected: String,
        got: String,
    },

    #[error("malformed block at height {0}")]
    MalformedBlock(u64),

    #[error("block body at height {0} was pruned")]
    Pruned(u64),

    #[error("storage corruption: {0}")]
    Corrupt(String),

    #[error("database error: {0}")]
    Db(String),

    #[error("serialization error: {0}")]
    Serde(String),

    #[error("io error: {0}")]
    Io(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StoreError::NonSequentialHeight { .. }
            | StoreError::HeightExists(_)
            | StoreError::HashExists(_)
            | StoreError::ParentMismatch { .. }
            | StoreError::MalformedBlock(_) => ErrorKind::Validation,
            StoreError::Pruned(_) | StoreError::Db(_) | StoreError::Serde(_) | StoreError::Io(_) => {
                ErrorKind::Resource
            }
            StoreError::Corrupt(_) => ErrorKind::Fatal,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            StoreError::NonSequentialHeight { .. } => "non_sequential_height",
            StoreError::HeightExists(_) => "height_exists",
            StoreError::HashExists(_) => "hash_exists",
            StoreError::ParentMismatch { .. } => "parent_mismatch",
            StoreError::MalformedBlock(_) => "malformed_block",
            StoreError::Pruned(_) => "pruned",
            StoreError::Corrupt(_) => "storage_corrupt",
            StoreError::Db(_) => "storage_write_failed",
            StoreError::Serde(_) => "serialization_failed",
            StoreError::Io(_) => "io_failed",
        }
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Db(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serde(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Io(e.to_string())
    }
}

/// Try to open RocksDB, retrying with backoff while another process still
/// holds the lock.
pub fn open_db(path: &str) -> Result<RocksDb, StoreError> {
    let mut attempt = 0u32;
    let max_attempts = 5u32;
    let mut wait = 100u64;

    loop {
        match open_rocksdb_internal(path) {
            Ok(db) => return Ok(Arc::new(db)),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts {
                    return Err(StoreError::Db(format!(
                        "failed to open RocksDB at '{}' after {} attempts: {}",
                        path, attempt, e
                    )));
                }
                log::warn!(
                    "open_db attempt {}/{} failed: {}, retrying in {}ms",
                    attempt,
                    max_attempts,
                    e,
                    wait
                );
                sleep(Duration::from_millis(wait));
                wait = std::cmp::min(wait * 2, 2000);
            }
        }
    }
}

fn open_rocksdb_internal(path: &str) -> Result<DB, rocksdb::Error> {
    let mut opts = Options::default();
    opts.create_if_missing(true);

    let num_cpus = num_cpus::get() as i32;
    opts.increase_parallelism(num_cpus);
    opts.set_max_background_jobs(4);
    opts.set_write_buffer_size(64 * 1024 * 1024); // 64MB
    opts.set_max_open_files(512);
    opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

    DB::open(&opts, path)
}

/// Put a serializable value under a byte-key.
pub fn put<K: AsRef<[u8]>, V: Serialize>(db: &RocksDb, key: K, val: &V) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(val)?;
    db.put(key, bytes)?;
    Ok(())
}

/// Get and deserialize a value stored under a byte-key.
pub fn get<K: AsRef<[u8]>, T: DeserializeOwned>(db: &RocksDb, key: K) -> Result<Option<T>, StoreError> {
    match db.get(key)? {
        Some(bytes) => Ok(Some(serde_json::from_slice::<T>(&bytes)?)),
        None => Ok(None),
    }
}

pub fn exists<K: AsRef<[u8]>>(db: &RocksDb, key: K) -> Result<bool, StoreError> {
    Ok(db.get_pinned(key)?.is_some())
}

/// Queue a serialized value into a write batch.
pub fn batch_put<K: AsRef<[u8]>, V: Serialize>(
    batch: &mut WriteBatch,
    key: K,
    val: &V,
) -> Result<(), StoreError> {
    batch.put(key, serde_json::to_vec(val)?);
    Ok(())
}

/// Get a raw little-endian u64 counter, `None` if unset.
pub fn get_counter(db: &RocksDb, key: &str) -> Result<Option<u64>, StoreError> {
    match db.get(key.as_bytes())? {
        Some(bytes) => {
            let arr: [u8; 8] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt(format!("invalid counter bytes at '{}'", key)))?;
            Ok(Some(u64::from_le_bytes(arr)))
        }
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn put_get_roundtrip_and_counter() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path().to_str().unwrap()).unwrap();
        put(&db, b"k", &vec![1u32, 2, 3]).unwrap();
        let v: Option<Vec<u32>> = get(&db, b"k").unwrap();
        assert_eq!(v, Some(vec![1, 2, 3]));
        assert!(exists(&db, b"k").unwrap());
        assert_eq!(get_counter(&db, "missing").unwrap(), None);
        db.put(b"c", 9u64.to_le_bytes()).unwrap();
        assert_eq!(get_counter(&db, "c").unwrap(), Some(9));
    }
}
