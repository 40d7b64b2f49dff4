//! Periodic cleanup.

use crate::{errors::*, traits::AuditSink, types::*};
use tracing::{debug, info, warn};
use vouch_crypto::{current_timestamp, current_timestamp_millis};
use vouch_storage::{Storage, CF_ACTIVATIONS, CF_TEMPORARY_KEYS, CF_USED_NONCES};

use super::VouchService;

impl<S, A> VouchService<S, A>
where
    S: Storage + 'static,
    A: AuditSink + 'static,
{
    /// Remove pending activations past their expiry
    ///
    /// Each activation gets its own transaction and is re-checked under its lock.
    pub(crate) async fn expire_pending_activations_internal(&self) -> Result<usize> {
        let now = current_timestamp();
        let candidates: Vec<(Vec<u8>, Activation)> = self.storage.scan_all(CF_ACTIVATIONS).await?;

        let mut expired = 0;
        for (_, candidate) in candidates {
            if !candidate.is_expired(now) {
                continue;
            }

            let mut scope = self.begin("expire_pending_activation").await?;
            let Some(mut activation) = self
                .locker
                .lock_for_update(&mut scope, candidate.activation_id)
                .await
            else {
                warn!("Activation {} vanished before expiry", candidate.activation_id);
                scope.finish(Ok(())).await?;
                continue;
            };

            match self.expire_if_pending(&mut scope, &mut activation) {
                Err(ServiceError::ActivationExpired(_)) => {
                    scope.finish(Ok(())).await?;
                    expired += 1;
                }
                other => {
                    scope.finish(other).await?;
                }
            }
        }

        if expired > 0 {
            info!("Expired {} pending activations", expired);
        }
        Ok(expired)
    }

    pub(crate) async fn purge_expired_temporary_keys_internal(&self) -> Result<usize> {
        let now_ms = current_timestamp_millis();
        let keys: Vec<(Vec<u8>, TemporaryKey)> = self.storage.scan_all(CF_TEMPORARY_KEYS).await?;

        let mut batch = self.storage.batch();
        let mut purged = 0;
        for (raw_key, key) in keys {
            if key.expires_at < now_ms {
                batch.delete_raw(CF_TEMPORARY_KEYS, raw_key)?;
                purged += 1;
            }
        }
        batch.commit().await?;

        debug!("Purged {} temporary keys", purged);
        Ok(purged)
    }

    pub(crate) async fn purge_used_nonces_internal(&self) -> Result<usize> {
        let now_ms = current_timestamp_millis();
        let nonces: Vec<(Vec<u8>, UsedNonce)> = self.storage.scan_all(CF_USED_NONCES).await?;

        let mut batch = self.storage.batch();
        let mut purged = 0;
        for (raw_key, nonce) in nonces {
            if nonce.expires_at < now_ms {
                batch.delete_raw(CF_USED_NONCES, raw_key)?;
                purged += 1;
            }
        }
        batch.commit().await?;

        debug!("Purged {} used nonces", purged);
        Ok(purged)
    }
}
