//! KV storage contract and backends.
//!
//! All operations are synchronous blocking I/O. Callers in async
//! contexts should use `spawn_blocking` where it matters. Writes go
//! through batch objects that are independent until committed; readers
//! see a consistent view only within a single batch's lifetime.

use rocksdb::{WriteBatch, DB};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Errors from a storage backend.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// A write batch, independent of the backend until committed.
pub trait StorageBatch: Send {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
    /// Approximate accumulated payload size in bytes.
    fn size(&self) -> usize;
    /// Atomically apply the batch and reset it for reuse.
    fn commit(&mut self) -> Result<(), StorageError>;
}

/// A KV store.
pub trait Storage: Send + Sync {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError>;
    fn delete(&self, key: &[u8]) -> Result<(), StorageError>;
    fn new_batch(&self) -> Box<dyn StorageBatch>;
}

/// A storage backend that can be opened from (and closed back to) a
/// directory, as the archiver requires for snapshot rotation.
pub trait StorageBackend: Storage + Sized + 'static {
    fn open(path: &Path) -> Result<Self, StorageError>;
}

// ═══════════════════════════════════════════════════════════════════════
// RocksDB backend
// ═══════════════════════════════════════════════════════════════════════

/// RocksDB-based storage for production use.
pub struct RocksDbStorage {
    db: Arc<DB>,
}

impl RocksDbStorage {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);
        let db = DB::open(&opts, path).map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }
}

impl Storage for RocksDbStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.db.get(key).ok().flatten()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.db
            .put(key, value)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.db
            .delete(key)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn new_batch(&self) -> Box<dyn StorageBatch> {
        Box::new(RocksDbBatch {
            db: Arc::clone(&self.db),
            batch: WriteBatch::default(),
            size: 0,
        })
    }
}

impl StorageBackend for RocksDbStorage {
    fn open(path: &Path) -> Result<Self, StorageError> {
        RocksDbStorage::open(path)
    }
}

struct RocksDbBatch {
    db: Arc<DB>,
    batch: WriteBatch,
    size: usize,
}

impl StorageBatch for RocksDbBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += key.len() + value.len();
        self.batch.put(key, value);
    }

    fn delete(&mut self, key: &[u8]) {
        self.size += key.len();
        self.batch.delete(key);
    }

    fn size(&self) -> usize {
        self.size
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let batch = std::mem::take(&mut self.batch);
        self.size = 0;
        self.db
            .write(batch)
            .map_err(|e| StorageError::Backend(e.to_string()))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// In-memory backend (tests, tooling)
// ═══════════════════════════════════════════════════════════════════════

/// In-memory storage backed by a `BTreeMap`.
#[derive(Default, Clone)]
pub struct MemoryStorage {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("storage lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All keys, for test assertions.
    pub fn keys(&self) -> Vec<Vec<u8>> {
        self.map
            .read()
            .expect("storage lock")
            .keys()
            .cloned()
            .collect()
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.read().expect("storage lock").get(key).cloned()
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StorageError> {
        self.map
            .write()
            .expect("storage lock")
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &[u8]) -> Result<(), StorageError> {
        self.map.write().expect("storage lock").remove(key);
        Ok(())
    }

    fn new_batch(&self) -> Box<dyn StorageBatch> {
        Box::new(MemoryBatch {
            map: Arc::clone(&self.map),
            ops: Vec::new(),
            size: 0,
        })
    }
}

enum MemoryOp {
    Put(Vec<u8>, Vec<u8>),
    Delete(Vec<u8>),
}

struct MemoryBatch {
    map: Arc<RwLock<BTreeMap<Vec<u8>, Vec<u8>>>>,
    ops: Vec<MemoryOp>,
    size: usize,
}

impl StorageBatch for MemoryBatch {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.size += key.len() + value.len();
        self.ops.push(MemoryOp::Put(key.to_vec(), value.to_vec()));
    }

    fn delete(&mut self, key: &[u8]) {
        self.size += key.len();
        self.ops.push(MemoryOp::Delete(key.to_vec()));
    }

    fn size(&self) -> usize {
        self.size
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut map = self.map.write().expect("storage lock");
        for op in self.ops.drain(..) {
            match op {
                MemoryOp::Put(key, value) => {
                    map.insert(key, value);
                }
                MemoryOp::Delete(key) => {
                    map.remove(&key);
                }
            }
        }
        self.size = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn basic_ops(storage: &dyn Storage) {
        assert!(storage.get(b"missing").is_none());
        storage.put(b"k", b"v").unwrap();
        assert_eq!(storage.get(b"k"), Some(b"v".to_vec()));
        storage.delete(b"k").unwrap();
        assert!(storage.get(b"k").is_none());

        let mut batch = storage.new_batch();
        batch.put(b"a", b"1");
        batch.put(b"b", b"2");
        batch.delete(b"a");
        assert!(batch.size() > 0);
        // Nothing visible until commit.
        assert!(storage.get(b"b").is_none());
        batch.commit().unwrap();
        assert!(storage.get(b"a").is_none());
        assert_eq!(storage.get(b"b"), Some(b"2".to_vec()));
        assert_eq!(batch.size(), 0);
    }

    #[test]
    fn memory_storage_ops() {
        basic_ops(&MemoryStorage::new());
    }

    #[test]
    fn rocksdb_storage_ops() {
        let dir = TempDir::new().unwrap();
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        basic_ops(&storage);
    }

    #[test]
    fn rocksdb_reopen_preserves_data() {
        let dir = TempDir::new().unwrap();
        {
            let storage = RocksDbStorage::open(dir.path()).unwrap();
            storage.put(b"persist", b"yes").unwrap();
        }
        let storage = RocksDbStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get(b"persist"), Some(b"yes".to_vec()));
    }
}
