//! Storage trait definitions.

use crate::errors::Result;
use crate::locks::{RowLock, RowLocks};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

/// Storage interface for key-value operations
///
/// This trait abstracts the underlying engine so services can run against RocksDB in
/// production and the in-memory engine in tests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Engine identity (for example `rocksdb` or `memory`)
    ///
    /// Callers select engine-specific strategies from this value.
    fn engine(&self) -> &str;

    /// Row lock table of this engine
    fn row_locks(&self) -> &RowLocks;

    /// Get a value by key from a column family
    ///
    /// # Returns
    ///
    /// `Ok(Some(value))` if key exists, `Ok(None)` if not found
    async fn get<K, V>(&self, cf: &str, key: &K) -> Result<Option<V>>
    where
        K: Serialize + Send + Sync,
        V: DeserializeOwned;

    /// Put a key-value pair into a column family
    async fn put<K, V>(&self, cf: &str, key: &K, value: &V) -> Result<()>
    where
        K: Serialize + Send + Sync,
        V: Serialize + Send + Sync;

    /// Delete a key from a column family
    async fn delete<K>(&self, cf: &str, key: &K) -> Result<()>
    where
        K: Serialize + Send + Sync;

    /// Check if a key exists in a column family
    async fn exists<K>(&self, cf: &str, key: &K) -> Result<bool>
    where
        K: Serialize + Send + Sync;

    /// Get multiple values by prefix (range query)
    ///
    /// Returns all key-value pairs where keys start with the given prefix.
    async fn get_by_prefix<K, V>(&self, cf: &str, prefix: &K) -> Result<Vec<(Vec<u8>, V)>>
    where
        K: Serialize + Send + Sync,
        V: DeserializeOwned;

    /// Get every key-value pair of a column family
    async fn scan_all<V>(&self, cf: &str) -> Result<Vec<(Vec<u8>, V)>>
    where
        V: DeserializeOwned;

    /// Create a new batch for atomic operations
    fn batch(&self) -> Box<dyn Batch>;

    /// Begin a transaction
    ///
    /// The transaction stages writes in a batch and keeps every row lock handed to it until
    /// commit or rollback.
    async fn begin_transaction(&self) -> Result<Transaction> {
        Ok(Transaction::new(self.batch()))
    }

    /// Lock a row for update, whether or not it exists
    ///
    /// Blocks while another transaction holds the same row.
    async fn lock_for_update<K>(&self, cf: &str, key: &K) -> Result<RowLock>
    where
        K: Serialize + Send + Sync,
    {
        let key_bytes = serialize_key(key)?;
        self.row_locks().acquire(cf, &key_bytes).await
    }

    /// Count rows stored under a key (0 or 1 for a key-value engine)
    ///
    /// Never takes a lock.
    async fn count_rows<K>(&self, cf: &str, key: &K) -> Result<u64>
    where
        K: Serialize + Send + Sync,
    {
        Ok(u64::from(self.exists(cf, key).await?))
    }

    /// Lock a row only if it exists
    ///
    /// Existence is re-checked after the lock is acquired, so a row deleted while waiting
    /// yields `Ok(None)`.
    async fn lock_existing_row<K>(&self, cf: &str, key: &K) -> Result<Option<RowLock>>
    where
        K: Serialize + Send + Sync,
    {
        let key_bytes = serialize_key(key)?;
        let lock = self.row_locks().acquire(cf, &key_bytes).await?;

        if self.exists(cf, key).await? {
            Ok(Some(lock))
        } else {
            debug!("Row vanished while waiting for lock in {}", cf);
            Ok(None)
        }
    }
}

/// Batch interface for atomic operations
///
/// Batches allow multiple operations to be performed atomically.
///
/// Note: This trait works with pre-serialized bytes to maintain object safety.
/// Use the `BatchExt` helper methods, or serialize your keys/values before calling the raw
/// methods.
///
/// Batches only need to be `Send` (not `Sync`) since they are used within a single
/// task context and not shared across threads.
#[async_trait]
pub trait Batch: Send {
    /// Put a pre-serialized key-value pair in the batch
    fn put_raw(&mut self, cf: &str, key: Vec<u8>, value: Vec<u8>) -> Result<()>;

    /// Delete a pre-serialized key in the batch
    fn delete_raw(&mut self, cf: &str, key: Vec<u8>) -> Result<()>;

    /// Commit the batch atomically
    async fn commit(self: Box<Self>) -> Result<()>;

    /// Rollback the batch (drop without committing)
    fn rollback(self: Box<Self>);
}

/// Extension trait providing type-safe methods for Batch
pub trait BatchExt: Batch {
    /// Put a key-value pair in the batch (type-safe)
    fn put<K, V>(&mut self, cf: &str, key: &K, value: &V) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
    {
        let key_bytes = serialize_key(key)?;
        let value_bytes = serialize_value(value)?;
        self.put_raw(cf, key_bytes, value_bytes)
    }

    /// Delete a key in the batch (type-safe)
    fn delete<K>(&mut self, cf: &str, key: &K) -> Result<()>
    where
        K: Serialize,
    {
        let key_bytes = serialize_key(key)?;
        self.delete_raw(cf, key_bytes)
    }
}

/// Automatically implement BatchExt for all types that implement Batch
impl<T: Batch + ?Sized> BatchExt for T {}

/// Unit of work: staged writes plus the row locks taken on their behalf
///
/// Dropping a transaction without committing discards the staged writes and releases the
/// locks.
pub struct Transaction {
    batch: Box<dyn Batch>,
    locks: Vec<RowLock>,
    staged_writes: usize,
}

impl Transaction {
    /// Wrap a batch
    pub fn new(batch: Box<dyn Batch>) -> Self {
        Self {
            batch,
            locks: Vec::new(),
            staged_writes: 0,
        }
    }

    /// Keep a row lock until this transaction ends
    pub fn hold(&mut self, lock: RowLock) {
        self.locks.push(lock);
    }

    /// Number of row locks held
    pub fn held_locks(&self) -> usize {
        self.locks.len()
    }

    /// Stage a put
    pub fn put<K, V>(&mut self, cf: &str, key: &K, value: &V) -> Result<()>
    where
        K: Serialize,
        V: Serialize,
    {
        self.batch.put(cf, key, value)?;
        self.staged_writes += 1;
        Ok(())
    }

    /// Stage a delete
    pub fn delete<K>(&mut self, cf: &str, key: &K) -> Result<()>
    where
        K: Serialize,
    {
        self.batch.delete(cf, key)?;
        self.staged_writes += 1;
        Ok(())
    }

    /// Whether any write has been staged
    pub fn has_writes(&self) -> bool {
        self.staged_writes > 0
    }

    /// Apply staged writes atomically, then release the locks
    pub async fn commit(self) -> Result<()> {
        let Transaction { batch, locks, .. } = self;
        let result = batch.commit().await;
        drop(locks);
        result
    }

    /// Discard staged writes and release the locks
    pub fn rollback(self) {
        let Transaction { batch, locks, .. } = self;
        batch.rollback();
        drop(locks);
    }
}

/// Helper function to serialize a key
pub(crate) fn serialize_key<K: Serialize + ?Sized>(key: &K) -> Result<Vec<u8>> {
    bincode::serialize(key).map_err(|e| crate::errors::StorageError::Serialization(e.to_string()))
}

/// Helper function to serialize a value
pub(crate) fn serialize_value<V: Serialize + ?Sized>(value: &V) -> Result<Vec<u8>> {
    bincode::serialize(value).map_err(|e| crate::errors::StorageError::Serialization(e.to_string()))
}

/// Helper function to deserialize a value
pub(crate) fn deserialize_value<V: DeserializeOwned>(bytes: &[u8]) -> Result<V> {
    bincode::deserialize(bytes)
        .map_err(|e| crate::errors::StorageError::Deserialization(e.to_string()))
}
