//! In-memory storage engine.
//!
//! Column families are ordered maps behind a read-write lock. Batches apply all of their
//! operations under one write lock, which gives the same atomicity as a RocksDB write batch.

use crate::{
    column_families::all_column_families,
    errors::{Result, StorageError},
    locks::RowLocks,
    traits::{deserialize_value, serialize_key, serialize_value, Batch, Storage},
};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tracing::debug;

/// Engine identity reported by [`MemoryStorage`]
pub const MEMORY_ENGINE: &str = "memory";

type Tables = HashMap<String, BTreeMap<Vec<u8>, Vec<u8>>>;

/// In-memory storage implementation
pub struct MemoryStorage {
    tables: Arc<RwLock<Tables>>,
    locks: RowLocks,
    engine: String,
}

impl MemoryStorage {
    /// Create an empty store with every column family
    pub fn new() -> Self {
        Self::with_engine(MEMORY_ENGINE)
    }

    /// Create an empty store that reports a different engine identity
    ///
    /// Useful to exercise engine-specific strategies without the engine itself.
    pub fn with_engine(engine: &str) -> Self {
        let tables = all_column_families()
            .into_iter()
            .map(|cf| (cf.to_string(), BTreeMap::new()))
            .collect();

        Self {
            tables: Arc::new(RwLock::new(tables)),
            locks: RowLocks::default(),
            engine: engine.to_string(),
        }
    }

    /// Override the row lock wait timeout
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.locks = RowLocks::new(timeout);
        self
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| StorageError::Database("memory tables poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| StorageError::Database("memory tables poisoned".to_string()))
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn table<'a>(tables: &'a Tables, cf: &str) -> Result<&'a BTreeMap<Vec<u8>, Vec<u8>>> {
    tables
        .get(cf)
        .ok_or_else(|| StorageError::InvalidColumnFamily(cf.to_string()))
}

fn table_mut<'a>(tables: &'a mut Tables, cf: &str) -> Result<&'a mut BTreeMap<Vec<u8>, Vec<u8>>> {
    tables
        .get_mut(cf)
        .ok_or_else(|| StorageError::InvalidColumnFamily(cf.to_string()))
}

#[async_trait]
impl Storage for MemoryStorage {
    fn engine(&self) -> &str {
        &self.engine
    }

    fn row_locks(&self) -> &RowLocks {
        &self.locks
    }

    async fn get<K, V>(&self, cf: &str, key: &K) -> Result<Option<V>>
    where
        K: Serialize + Send + Sync,
        V: DeserializeOwned,
    {
        let key_bytes = serialize_key(key)?;
        let tables = self.read()?;

        match table(&tables, cf)?.get(&key_bytes) {
            Some(bytes) => Ok(Some(deserialize_value(bytes)?)),
            None => Ok(None),
        }
    }

    async fn put<K, V>(&self, cf: &str, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + Send + Sync,
        V: Serialize + Send + Sync,
    {
        let key_bytes = serialize_key(key)?;
        let value_bytes = serialize_value(value)?;
        let mut tables = self.write()?;

        table_mut(&mut tables, cf)?.insert(key_bytes, value_bytes);
        Ok(())
    }

    async fn delete<K>(&self, cf: &str, key: &K) -> Result<()>
    where
        K: Serialize + Send + Sync,
    {
        let key_bytes = serialize_key(key)?;
        let mut tables = self.write()?;

        table_mut(&mut tables, cf)?.remove(&key_bytes);
        Ok(())
    }

    async fn exists<K>(&self, cf: &str, key: &K) -> Result<bool>
    where
        K: Serialize + Send + Sync,
    {
        let key_bytes = serialize_key(key)?;
        let tables = self.read()?;

        Ok(table(&tables, cf)?.contains_key(&key_bytes))
    }

    async fn get_by_prefix<K, V>(&self, cf: &str, prefix: &K) -> Result<Vec<(Vec<u8>, V)>>
    where
        K: Serialize + Send + Sync,
        V: DeserializeOwned,
    {
        let prefix_bytes = serialize_key(prefix)?;
        let tables = self.read()?;

        let mut results = Vec::new();
        for (key, value) in table(&tables, cf)?.range(prefix_bytes.clone()..) {
            if !key.starts_with(&prefix_bytes) {
                break;
            }
            results.push((key.clone(), deserialize_value(value)?));
        }
        Ok(results)
    }

    async fn scan_all<V>(&self, cf: &str) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: DeserializeOwned,
    {
        let tables = self.read()?;

        table(&tables, cf)?
            .iter()
            .map(|(key, value)| Ok((key.clone(), deserialize_value(value)?)))
            .collect()
    }

    fn batch(&self) -> Box<dyn Batch> {
        Box::new(MemoryBatch {
            tables: Arc::clone(&self.tables),
            ops: Vec::new(),
        })
    }
}

enum BatchOp {
    Put(String, Vec<u8>, Vec<u8>),
    Delete(String, Vec<u8>),
}

/// In-memory batch implementation
pub struct MemoryBatch {
    tables: Arc<RwLock<Tables>>,
    ops: Vec<BatchOp>,
}

#[async_trait]
impl Batch for MemoryBatch {
    fn put_raw(&mut self, cf: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()> {
        self.ops.push(BatchOp::Put(cf.to_string(), key, value));
        Ok(())
    }

    fn delete_raw(&mut self, cf: &str, key: Vec<u8>) -> Result<()> {
        self.ops.push(BatchOp::Delete(cf.to_string(), key));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let mut tables = self
            .tables
            .write()
            .map_err(|_| StorageError::Database("memory tables poisoned".to_string()))?;

        // Validate first so a bad column family leaves nothing half-applied
        for op in &self.ops {
            let cf = match op {
                BatchOp::Put(cf, _, _) | BatchOp::Delete(cf, _) => cf,
            };
            table(&tables, cf)?;
        }

        let count = self.ops.len();
        for op in self.ops {
            match op {
                BatchOp::Put(cf, key, value) => {
                    table_mut(&mut tables, &cf)?.insert(key, value);
                }
                BatchOp::Delete(cf, key) => {
                    table_mut(&mut tables, &cf)?.remove(&key);
                }
            }
        }

        debug!("Memory batch committed {} operations", count);
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        debug!("Memory batch rolled back");
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
    struct Row {
        id: Uuid,
        value: u64,
    }

    #[tokio::test]
    async fn test_put_get_delete() {
        let storage = MemoryStorage::new();
        let id = Uuid::new_v4();
        let row = Row { id, value: 7 };

        storage.put(CF_ACTIVATIONS, &id, &row).await.unwrap();
        let loaded: Option<Row> = storage.get(CF_ACTIVATIONS, &id).await.unwrap();
        assert_eq!(loaded, Some(row));

        storage.delete(CF_ACTIVATIONS, &id).await.unwrap();
        assert!(!storage.exists(CF_ACTIVATIONS, &id).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_column_family() {
        let storage = MemoryStorage::new();
        let result: Result<Option<Row>> = storage.get("nope", &1u8).await;
        assert!(matches!(result, Err(StorageError::InvalidColumnFamily(_))));
    }

    #[tokio::test]
    async fn test_batch_is_atomic() {
        let storage = MemoryStorage::new();

        let mut batch = storage.batch();
        batch.put(CF_ACTIVATIONS, &1u32, &Row { id: Uuid::nil(), value: 1 }).unwrap();
        batch.put("missing_cf", &2u32, &Row { id: Uuid::nil(), value: 2 }).unwrap();
        assert!(batch.commit().await.is_err());

        assert!(!storage.exists(CF_ACTIVATIONS, &1u32).await.unwrap());
    }

    #[tokio::test]
    async fn test_prefix_scan() {
        let storage = MemoryStorage::new();
        storage.put(CF_ACTIVATIONS_BY_USER, &("u1".to_string(), 1u32), &()).await.unwrap();
        storage.put(CF_ACTIVATIONS_BY_USER, &("u1".to_string(), 2u32), &()).await.unwrap();
        storage.put(CF_ACTIVATIONS_BY_USER, &("u2".to_string(), 3u32), &()).await.unwrap();

        let rows: Vec<(Vec<u8>, ())> = storage
            .get_by_prefix(CF_ACTIVATIONS_BY_USER, &"u1".to_string())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let all: Vec<(Vec<u8>, ())> = storage.scan_all(CF_ACTIVATIONS_BY_USER).await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_writes() {
        let storage = MemoryStorage::new();
        let mut tx = storage.begin_transaction().await.unwrap();
        tx.put(CF_ACTIVATIONS, &9u32, &Row { id: Uuid::nil(), value: 9 }).unwrap();
        assert!(tx.has_writes());
        tx.rollback();

        assert!(!storage.exists(CF_ACTIVATIONS, &9u32).await.unwrap());
    }

    #[tokio::test]
    async fn test_transaction_holds_lock_until_commit() {
        let storage = Arc::new(MemoryStorage::new().with_lock_timeout(Duration::from_millis(30)));
        let mut tx = storage.begin_transaction().await.unwrap();
        let lock = storage.lock_for_update(CF_ACTIVATIONS, &9u32).await.unwrap();
        tx.hold(lock);
        assert_eq!(tx.held_locks(), 1);

        assert!(storage.lock_for_update(CF_ACTIVATIONS, &9u32).await.is_err());

        tx.put(CF_ACTIVATIONS, &9u32, &Row { id: Uuid::nil(), value: 9 }).unwrap();
        tx.commit().await.unwrap();

        assert!(storage.lock_for_update(CF_ACTIVATIONS, &9u32).await.is_ok());
        assert!(storage.exists(CF_ACTIVATIONS, &9u32).await.unwrap());
    }

    #[tokio::test]
    async fn test_lock_existing_row() {
        let storage = MemoryStorage::with_engine("rocksdb");
        assert_eq!(storage.engine(), "rocksdb");

        assert_eq!(storage.count_rows(CF_ACTIVATIONS, &1u32).await.unwrap(), 0);
        assert!(storage.lock_existing_row(CF_ACTIVATIONS, &1u32).await.unwrap().is_none());

        storage.put(CF_ACTIVATIONS, &1u32, &Row { id: Uuid::nil(), value: 1 }).await.unwrap();
        assert_eq!(storage.count_rows(CF_ACTIVATIONS, &1u32).await.unwrap(), 1);
        assert!(storage.lock_existing_row(CF_ACTIVATIONS, &1u32).await.unwrap().is_some());
    }
}
