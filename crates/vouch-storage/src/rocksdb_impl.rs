//! RocksDB storage implementation.

use crate::{
    column_families::all_column_families,
    errors::{Result, StorageError},
    locks::{RowLocks, DEFAULT_LOCK_TIMEOUT},
    traits::{deserialize_value, serialize_key, serialize_value, Batch, Storage},
};
use async_trait::async_trait;
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};
use std::{path::Path, sync::Arc, time::Duration};
use tempfile::TempDir;
use tracing::debug;

/// Engine identity reported by [`RocksDbStorage`]
pub const ROCKSDB_ENGINE: &str = "rocksdb";

/// RocksDB storage implementation
pub struct RocksDbStorage {
    db: Arc<DB>,
    locks: RowLocks,
    // Keeps the directory of a test database alive as long as the handle
    _temp_dir: Option<TempDir>,
}

impl RocksDbStorage {
    /// Open RocksDB database at the specified path
    ///
    /// Creates all required column families if they don't exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_lock_timeout(path, DEFAULT_LOCK_TIMEOUT)
    }

    /// Open RocksDB database with a custom row lock wait timeout
    pub fn open_with_lock_timeout<P: AsRef<Path>>(path: P, lock_timeout: Duration) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let db = DB::open_cf(&opts, &path, all_column_families())
            .map_err(|e| StorageError::Database(e.to_string()))?;

        debug!("Opened RocksDB at {:?}", path.as_ref());

        Ok(Self {
            db: Arc::new(db),
            locks: RowLocks::new(lock_timeout),
            _temp_dir: None,
        })
    }

    /// Open a database in a fresh temporary directory
    ///
    /// The directory is removed when the storage is dropped.
    pub fn open_test() -> Result<Self> {
        let temp_dir = TempDir::new().map_err(StorageError::IoError)?;
        let mut storage = Self::open(temp_dir.path())?;
        storage._temp_dir = Some(temp_dir);
        Ok(storage)
    }

    fn cf_handle(&self, cf: &str) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(cf)
            .ok_or_else(|| StorageError::InvalidColumnFamily(cf.to_string()))
    }
}

#[async_trait]
impl Storage for RocksDbStorage {
    fn engine(&self) -> &str {
        ROCKSDB_ENGINE
    }

    fn row_locks(&self) -> &RowLocks {
        &self.locks
    }

    async fn get<K, V>(&self, cf: &str, key: &K) -> Result<Option<V>>
    where
        K: Serialize + Send + Sync,
        V: DeserializeOwned,
    {
        let cf_handle = self.cf_handle(cf)?;
        let key_bytes = serialize_key(key)?;

        let result = self
            .db
            .get_cf(cf_handle, &key_bytes)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        result.map(|bytes| deserialize_value(&bytes)).transpose()
    }

    async fn put<K, V>(&self, cf: &str, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + Send + Sync,
        V: Serialize + Send + Sync,
    {
        let cf_handle = self.cf_handle(cf)?;
        let key_bytes = serialize_key(key)?;
        let value_bytes = serialize_value(value)?;

        self.db
            .put_cf(cf_handle, &key_bytes, &value_bytes)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn delete<K>(&self, cf: &str, key: &K) -> Result<()>
    where
        K: Serialize + Send + Sync,
    {
        let cf_handle = self.cf_handle(cf)?;
        let key_bytes = serialize_key(key)?;

        self.db
            .delete_cf(cf_handle, &key_bytes)
            .map_err(|e| StorageError::Database(e.to_string()))
    }

    async fn exists<K>(&self, cf: &str, key: &K) -> Result<bool>
    where
        K: Serialize + Send + Sync,
    {
        let cf_handle = self.cf_handle(cf)?;
        let key_bytes = serialize_key(key)?;

        let result = self
            .db
            .get_pinned_cf(cf_handle, &key_bytes)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(result.is_some())
    }

    async fn get_by_prefix<K, V>(&self, cf: &str, prefix: &K) -> Result<Vec<(Vec<u8>, V)>>
    where
        K: Serialize + Send + Sync,
        V: DeserializeOwned,
    {
        let cf_handle = self.cf_handle(cf)?;
        let prefix_bytes = serialize_key(prefix)?;

        let mut results = Vec::new();

        // Seek to the prefix; no prefix extractor is configured
        let iter = self
            .db
            .iterator_cf(cf_handle, IteratorMode::From(&prefix_bytes, Direction::Forward));

        for item in iter {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            if !key.starts_with(&prefix_bytes) {
                break;
            }
            results.push((key.to_vec(), deserialize_value(&value)?));
        }

        Ok(results)
    }

    async fn scan_all<V>(&self, cf: &str) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: DeserializeOwned,
    {
        let cf_handle = self.cf_handle(cf)?;

        let mut results = Vec::new();
        for item in self.db.iterator_cf(cf_handle, IteratorMode::Start) {
            let (key, value) = item.map_err(|e| StorageError::Database(e.to_string()))?;
            results.push((key.to_vec(), deserialize_value(&value)?));
        }

        Ok(results)
    }

    fn batch(&self) -> Box<dyn Batch> {
        Box::new(RocksDbBatch {
            db: Arc::clone(&self.db),
            write_batch: WriteBatch::default(),
        })
    }
}

/// RocksDB batch implementation
pub struct RocksDbBatch {
    db: Arc<DB>,
    write_batch: WriteBatch,
}

#[async_trait]
impl Batch for RocksDbBatch {
    fn put_raw(&mut self, cf: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        let db = Arc::clone(&self.db);
        let cf_handle = db
            .cf_handle(cf)
            .ok_or_else(|| StorageError::InvalidColumnFamily(cf.to_string()))?;

        self.write_batch.put_cf(cf_handle, &key, &value);
        Ok(())
    }

    fn delete_raw(&mut self, cf: &str, key: Vec<u8>) -> Result<()> {
        let db = Arc::clone(&self.db);
        let cf_handle = db
            .cf_handle(cf)
            .ok_or_else(|| StorageError::InvalidColumnFamily(cf.to_string()))?;

        self.write_batch.delete_cf(cf_handle, &key);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let count = self.write_batch.len();
        self.db
            .write(self.write_batch)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        debug!("RocksDB batch committed {} operations", count);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!("RocksDB batch rolled back");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::column_families::*;
    use crate::traits::BatchExt;
    use serde::Deserialize;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct TestRecord {
        id: Uuid,
        user_id: String,
        counter: u64,
    }

    fn record(counter: u64) -> TestRecord {
        TestRecord {
            id: Uuid::new_v4(),
            user_id: "alice".to_string(),
            counter,
        }
    }

    #[tokio::test]
    async fn test_put_get_exists_delete() {
        let storage = RocksDbStorage::open_test().unwrap();
        let data = record(42);

        assert!(!storage.exists(CF_ACTIVATIONS, &data.id).await.unwrap());
        storage.put(CF_ACTIVATIONS, &data.id, &data).await.unwrap();

        let loaded: Option<TestRecord> = storage.get(CF_ACTIVATIONS, &data.id).await.unwrap();
        assert_eq!(loaded, Some(data.clone()));

        storage.delete(CF_ACTIVATIONS, &data.id).await.unwrap();
        let loaded: Option<TestRecord> = storage.get(CF_ACTIVATIONS, &data.id).await.unwrap();
        assert_eq!(loaded, None);
    }

    #[tokio::test]
    async fn test_engine_identity() {
        let storage = RocksDbStorage::open_test().unwrap();
        assert_eq!(storage.engine(), ROCKSDB_ENGINE);
    }

    #[tokio::test]
    async fn test_batch_commit_and_rollback() {
        let storage = RocksDbStorage::open_test().unwrap();
        let first = record(1);
        let second = record(2);

        let mut batch = storage.batch();
        batch.put(CF_ACTIVATIONS, &first.id, &first).unwrap();
        batch.commit().await.unwrap();

        let mut batch = storage.batch();
        batch.put(CF_ACTIVATIONS, &second.id, &second).unwrap();
        batch.rollback();

        assert!(storage.exists(CF_ACTIVATIONS, &first.id).await.unwrap());
        assert!(!storage.exists(CF_ACTIVATIONS, &second.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_batch_rejects_unknown_column_family() {
        let storage = RocksDbStorage::open_test().unwrap();
        let mut batch = storage.batch();
        assert!(batch.put("unknown", &1u8, &1u8).is_err());
        assert!(batch.delete("unknown", &1u8).is_err());
    }

    #[tokio::test]
    async fn test_get_by_prefix_and_scan_all() {
        let storage = RocksDbStorage::open_test().unwrap();
        let a1 = Uuid::new_v4();
        let a2 = Uuid::new_v4();

        storage
            .put(CF_ACTIVATIONS_BY_USER, &("alice".to_string(), a1), &())
            .await
            .unwrap();
        storage
            .put(CF_ACTIVATIONS_BY_USER, &("alice".to_string(), a2), &())
            .await
            .unwrap();
        storage
            .put(CF_ACTIVATIONS_BY_USER, &("bob".to_string(), Uuid::new_v4()), &())
            .await
            .unwrap();

        let alice: Vec<(Vec<u8>, ())> = storage
            .get_by_prefix(CF_ACTIVATIONS_BY_USER, &"alice".to_string())
            .await
            .unwrap();
        assert_eq!(alice.len(), 2);

        let all: Vec<(Vec<u8>, ())> = storage.scan_all(CF_ACTIVATIONS_BY_USER).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_transaction_commit_releases_locks() {
        let storage = RocksDbStorage::open_test().unwrap();
        let data = record(5);
        storage.put(CF_ACTIVATIONS, &data.id, &data).await.unwrap();

        let mut tx = storage.begin_transaction().await.unwrap();
        let lock = storage
            .lock_existing_row(CF_ACTIVATIONS, &data.id)
            .await
            .unwrap()
            .unwrap();
        tx.hold(lock);

        let updated = TestRecord { counter: 6, ..data.clone() };
        tx.put(CF_ACTIVATIONS, &data.id, &updated).unwrap();
        tx.commit().await.unwrap();

        let loaded: Option<TestRecord> = storage.get(CF_ACTIVATIONS, &data.id).await.unwrap();
        assert_eq!(loaded.map(|r| r.counter), Some(6));
        assert!(storage.lock_for_update(CF_ACTIVATIONS, &data.id).await.is_ok());
    }
}
