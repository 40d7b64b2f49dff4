//! Record locking for state transitions.
//!
//! Two strategies exist. `Generic` locks the row and reads it, whether or not it exists.
//! `RowLockWorkaround` counts the row first and only enters the lock table when exactly one row
//! exists, so probing unknown identifiers never blocks or grows the lock table.
//!
//! The strategy is picked once from the storage engine identity.

use crate::types::{Activation, RecoveryCode};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;
use vouch_storage::{Storage, StorageError, Transaction, CF_ACTIVATIONS, CF_RECOVERY_CODES};

/// How a record is locked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockingStrategy {
    /// Lock, then read
    Generic,
    /// Count, then lock only an existing row
    RowLockWorkaround,
}

/// Engine identity to strategy; engines not listed use `Generic`
const STRATEGY_TABLE: &[(&str, LockingStrategy)] = &[
    ("rocksdb", LockingStrategy::RowLockWorkaround),
    ("memory", LockingStrategy::Generic),
];

impl LockingStrategy {
    /// Strategy for a storage engine
    pub fn for_engine(engine: &str) -> Self {
        STRATEGY_TABLE
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(engine))
            .map(|(_, strategy)| *strategy)
            .unwrap_or(LockingStrategy::Generic)
    }
}

/// Hands out exclusively locked views of activations and recovery codes
///
/// Locks are parked in the caller's transaction and released when it ends.
pub struct RecordLocker<S: Storage> {
    storage: Arc<S>,
    strategy: LockingStrategy,
}

impl<S: Storage> RecordLocker<S> {
    /// Create a locker with the strategy of the storage engine
    pub fn new(storage: Arc<S>) -> Self {
        let strategy = LockingStrategy::for_engine(storage.engine());
        debug!("Record locking for engine {} uses {:?}", storage.engine(), strategy);
        Self { storage, strategy }
    }

    /// Strategy in use
    pub fn strategy(&self) -> LockingStrategy {
        self.strategy
    }

    /// Lock an activation for the rest of the transaction
    ///
    /// `None` when the activation does not exist or locking failed.
    pub async fn lock_for_update(&self, tx: &mut Transaction, activation_id: Uuid) -> Option<Activation> {
        self.lock_record(tx, CF_ACTIVATIONS, activation_id).await
    }

    /// Lock a recovery code for the rest of the transaction
    pub async fn lock_recovery_code(&self, tx: &mut Transaction, recovery_code_id: Uuid) -> Option<RecoveryCode> {
        self.lock_record(tx, CF_RECOVERY_CODES, recovery_code_id).await
    }

    async fn lock_record<V>(&self, tx: &mut Transaction, cf: &str, id: Uuid) -> Option<V>
    where
        V: DeserializeOwned,
    {
        let result = match self.strategy {
            LockingStrategy::Generic => self.lock_generic(tx, cf, id).await,
            LockingStrategy::RowLockWorkaround => self.lock_existing(tx, cf, id).await,
        };

        match result {
            Ok(record) => record,
            Err(e) => {
                warn!("Locking {} record {} failed: {}", cf, id, e);
                None
            }
        }
    }

    async fn lock_generic<V>(&self, tx: &mut Transaction, cf: &str, id: Uuid) -> Result<Option<V>, StorageError>
    where
        V: DeserializeOwned,
    {
        let lock = self.storage.lock_for_update(cf, &id).await?;
        tx.hold(lock);
        self.storage.get(cf, &id).await
    }

    async fn lock_existing<V>(&self, tx: &mut Transaction, cf: &str, id: Uuid) -> Result<Option<V>, StorageError>
    where
        V: DeserializeOwned,
    {
        if self.storage.count_rows(cf, &id).await? != 1 {
            debug!("No {} record {}, skipping lock", cf, id);
            return Ok(None);
        }

        match self.storage.lock_existing_row(cf, &id).await? {
            Some(lock) => {
                tx.hold(lock);
                self.storage.get(cf, &id).await
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;
    use vouch_storage::MemoryStorage;

    #[rstest]
    #[case("rocksdb", LockingStrategy::RowLockWorkaround)]
    #[case("RocksDB", LockingStrategy::RowLockWorkaround)]
    #[case("memory", LockingStrategy::Generic)]
    #[case("postgres", LockingStrategy::Generic)]
    #[case("", LockingStrategy::Generic)]
    fn test_strategy_table(#[case] engine: &str, #[case] expected: LockingStrategy) {
        assert_eq!(LockingStrategy::for_engine(engine), expected);
    }

    #[tokio::test]
    async fn test_strategy_selected_from_engine() {
        let locker = RecordLocker::new(Arc::new(MemoryStorage::with_engine("rocksdb")));
        assert_eq!(locker.strategy(), LockingStrategy::RowLockWorkaround);

        let locker = RecordLocker::new(Arc::new(MemoryStorage::new()));
        assert_eq!(locker.strategy(), LockingStrategy::Generic);
    }

    #[tokio::test]
    async fn test_missing_record_under_workaround_takes_no_lock() {
        let storage = Arc::new(MemoryStorage::with_engine("rocksdb"));
        let locker = RecordLocker::new(Arc::clone(&storage));

        let mut tx = storage.begin_transaction().await.unwrap();
        assert!(locker.lock_for_update(&mut tx, Uuid::new_v4()).await.is_none());
        assert_eq!(tx.held_locks(), 0);
        assert_eq!(storage.row_locks().slot_count(), 0);
    }

    #[tokio::test]
    async fn test_missing_record_under_generic_holds_lock() {
        let storage = Arc::new(MemoryStorage::new());
        let locker = RecordLocker::new(Arc::clone(&storage));

        let mut tx = storage.begin_transaction().await.unwrap();
        assert!(locker.lock_for_update(&mut tx, Uuid::new_v4()).await.is_none());
        assert_eq!(tx.held_locks(), 1);
    }

    #[tokio::test]
    async fn test_lock_timeout_maps_to_none() {
        let storage = Arc::new(MemoryStorage::new().with_lock_timeout(Duration::from_millis(20)));
        let locker = RecordLocker::new(Arc::clone(&storage));
        let id = Uuid::new_v4();

        let mut first = storage.begin_transaction().await.unwrap();
        locker.lock_for_update(&mut first, id).await;

        let mut second = storage.begin_transaction().await.unwrap();
        assert!(locker.lock_for_update(&mut second, id).await.is_none());
        assert_eq!(second.held_locks(), 0);

        first.rollback();
    }
}
