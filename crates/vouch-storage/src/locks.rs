//! Row-level exclusive locks.
//!
//! Neither engine offers `SELECT ... FOR UPDATE`, so row locks live in an in-process lock
//! table: one async mutex per `(column family, key)` slot. A [`RowLock`] holds the slot's
//! owned guard; the row stays locked until the guard is dropped, which transactions do on
//! commit or rollback.

use crate::errors::{Result, StorageError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

/// Slots above this count trigger a sweep of idle entries
const PRUNE_THRESHOLD: usize = 1024;

/// Default wait before a lock attempt gives up
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

type Slot = Arc<AsyncMutex<()>>;

/// Exclusive lock on one row
#[derive(Debug)]
pub struct RowLock {
    cf: String,
    _guard: OwnedMutexGuard<()>,
}

impl RowLock {
    /// Column family of the locked row
    pub fn column_family(&self) -> &str {
        &self.cf
    }
}

/// Lock table shared by all transactions of one storage engine
#[derive(Debug)]
pub struct RowLocks {
    slots: Mutex<HashMap<Vec<u8>, Slot>>,
    wait_timeout: Duration,
}

impl RowLocks {
    /// Create a lock table with the given wait timeout
    pub fn new(wait_timeout: Duration) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            wait_timeout,
        }
    }

    /// Acquire the exclusive lock for a row, waiting up to the configured timeout
    pub async fn acquire(&self, cf: &str, key: &[u8]) -> Result<RowLock> {
        let slot = self.slot(cf, key)?;

        let guard = tokio::time::timeout(self.wait_timeout, slot.lock_owned())
            .await
            .map_err(|_| StorageError::LockTimeout {
                cf: cf.to_string(),
                timeout_ms: u64::try_from(self.wait_timeout.as_millis()).unwrap_or(u64::MAX),
            })?;

        Ok(RowLock {
            cf: cf.to_string(),
            _guard: guard,
        })
    }

    /// Number of slots currently in the table
    pub fn slot_count(&self) -> usize {
        self.slots.lock().map(|slots| slots.len()).unwrap_or(0)
    }

    fn slot(&self, cf: &str, key: &[u8]) -> Result<Slot> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| StorageError::Database("row lock table poisoned".to_string()))?;

        if slots.len() > PRUNE_THRESHOLD {
            let before = slots.len();
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            debug!("Pruned {} idle row lock slots", before - slots.len());
        }

        let slot = slots
            .entry(slot_key(cf, key))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())));
        Ok(Arc::clone(slot))
    }
}

impl Default for RowLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

fn slot_key(cf: &str, key: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(cf.len() + 1 + key.len());
    out.extend_from_slice(cf.as_bytes());
    out.push(0);
    out.extend_from_slice(key);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_second_locker_waits_for_release() {
        let locks = Arc::new(RowLocks::new(Duration::from_secs(5)));
        let first = locks.acquire("activations", b"a1").await.unwrap();

        let contender = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move { locks.acquire("activations", b"a1").await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        drop(first);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_timeout_when_held() {
        let locks = RowLocks::new(Duration::from_millis(20));
        let _held = locks.acquire("activations", b"a1").await.unwrap();

        let err = locks.acquire("activations", b"a1").await.unwrap_err();
        assert!(matches!(err, StorageError::LockTimeout { timeout_ms: 20, .. }));
    }

    #[tokio::test]
    async fn test_distinct_rows_do_not_contend() {
        let locks = RowLocks::new(Duration::from_millis(20));
        let _a = locks.acquire("activations", b"a1").await.unwrap();
        let b = locks.acquire("activations", b"a2").await.unwrap();
        let c = locks.acquire("recovery_codes", b"a1").await.unwrap();
        assert_eq!(b.column_family(), "activations");
        assert_eq!(c.column_family(), "recovery_codes");
        assert_eq!(locks.slot_count(), 3);
    }
}
