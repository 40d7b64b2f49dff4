//! Transactional operation wrapper.
//!
//! Every service operation runs inside one [`TransactionScope`] and ends with
//! [`TransactionScope::finish`], which decides the fate of the staged writes from the
//! operation's result:
//!
//! * `Ok` commits.
//! * An error that requires rollback (storage, unknown, or marked with
//!   [`ServiceError::rollback`]) is logged and rolls back.
//! * Any other error commits what was staged before it was raised, so failure counters,
//!   forced removals and expiries survive the rejection, then returns the error.

use crate::errors::{Result, ServiceError};
use std::ops::{Deref, DerefMut};
use tracing::{debug, error};
use vouch_storage::{Storage, Transaction};

/// One operation's transaction
pub struct TransactionScope {
    tx: Transaction,
    operation: &'static str,
}

impl TransactionScope {
    /// Begin a transaction for `operation`
    pub async fn begin<S: Storage>(storage: &S, operation: &'static str) -> Result<Self> {
        let tx = storage.begin_transaction().await?;
        Ok(Self { tx, operation })
    }

    /// Operation name
    pub fn operation(&self) -> &'static str {
        self.operation
    }

    /// End the transaction according to `result`
    pub async fn finish<T>(self, result: Result<T>) -> Result<T> {
        let Self { tx, operation } = self;

        match result {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(err) if err.requires_rollback() => {
                error!("{} failed, rolling back: {}", operation, err);
                tx.rollback();
                Err(err.into_root())
            }
            Err(err) => {
                if tx.has_writes() {
                    debug!("{} rejected with {}, keeping staged writes", operation, err.code());
                    if let Err(commit_err) = tx.commit().await {
                        error!("{} could not persist staged writes: {}", operation, commit_err);
                        return Err(commit_err.into());
                    }
                } else {
                    debug!("{} rejected with {}", operation, err.code());
                    tx.rollback();
                }
                Err(err)
            }
        }
    }
}

impl Deref for TransactionScope {
    type Target = Transaction;

    fn deref(&self) -> &Transaction {
        &self.tx
    }
}

impl DerefMut for TransactionScope {
    fn deref_mut(&mut self) -> &mut Transaction {
        &mut self.tx
    }
}

/// Shorthand for wrapping an error raised after the first staged write
pub(crate) trait RollbackExt<T> {
    /// Mark any error as rollback-required
    fn or_rollback(self) -> Result<T>;
}

impl<T, E: Into<ServiceError>> RollbackExt<T> for std::result::Result<T, E> {
    fn or_rollback(self) -> Result<T> {
        self.map_err(|e| e.into().rollback())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vouch_storage::{MemoryStorage, CF_ACTIVATIONS};

    async fn stage_one(storage: &MemoryStorage) -> TransactionScope {
        let mut scope = TransactionScope::begin(storage, "test").await.unwrap();
        scope.put(CF_ACTIVATIONS, &1u32, &"value".to_string()).unwrap();
        scope
    }

    #[tokio::test]
    async fn test_success_commits() {
        let storage = MemoryStorage::new();
        let scope = stage_one(&storage).await;

        assert_eq!(scope.finish(Ok(7)).await.unwrap(), 7);
        assert!(storage.exists(CF_ACTIVATIONS, &1u32).await.unwrap());
    }

    #[tokio::test]
    async fn test_rollback_required_discards_writes() {
        let storage = MemoryStorage::new();
        let scope = stage_one(&storage).await;

        let err = scope
            .finish::<()>(Err(ServiceError::EncryptionFailed.rollback()))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::EncryptionFailed));
        assert!(!storage.exists(CF_ACTIVATIONS, &1u32).await.unwrap());
    }

    #[tokio::test]
    async fn test_neutral_error_keeps_staged_writes() {
        let storage = MemoryStorage::new();
        let scope = stage_one(&storage).await;

        let err = scope
            .finish::<()>(Err(ServiceError::InvalidSignature))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSignature));
        assert!(storage.exists(CF_ACTIVATIONS, &1u32).await.unwrap());
    }

    #[tokio::test]
    async fn test_storage_error_rolls_back() {
        let storage = MemoryStorage::new();
        let scope = stage_one(&storage).await;

        let err = scope
            .finish::<()>(Err(vouch_storage::StorageError::Database("boom".to_string()).into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNKNOWN_ERROR");
        assert!(!storage.exists(CF_ACTIVATIONS, &1u32).await.unwrap());
    }

    #[test]
    fn test_or_rollback_marks_errors() {
        let result: std::result::Result<(), vouch_crypto::CryptoError> =
            Err(vouch_crypto::CryptoError::EncryptionFailed("x".to_string()));
        let err = result.or_rollback().unwrap_err();
        assert!(err.requires_rollback());
        assert_eq!(err.code(), "ENCRYPTION_FAILED");
    }
}
