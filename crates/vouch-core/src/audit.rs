//! Signature audit sinks.

use crate::{errors::Result, traits::AuditSink, types::ActivationStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Mutex;
use tracing::info;
use uuid::Uuid;
use vouch_crypto::SignatureType;

/// Extra audit attribute recorded when an offline verification allowed biometry
pub const AUDIT_BIOMETRY_ALLOWED: &str = "BIOMETRY_ALLOWED";

/// One signature verification attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureAuditRecord {
    pub activation_id: Uuid,
    pub user_id: String,
    pub application_id: String,
    pub signature_type: SignatureType,
    pub signature_version: u8,
    pub valid: bool,
    /// Numeric counter after the attempt
    pub counter: u64,
    pub activation_status: ActivationStatus,
    pub failed_attempts: u32,
    pub note: String,
    pub attributes: BTreeMap<String, String>,
    /// Unix seconds
    pub timestamp: u64,
}

/// Writes audit records as structured tracing events under the `vouch::audit` target
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn record(&self, record: SignatureAuditRecord) -> Result<()> {
        info!(
            target: "vouch::audit",
            activation_id = %record.activation_id,
            user_id = %record.user_id,
            application_id = %record.application_id,
            signature_type = %record.signature_type,
            signature_version = record.signature_version,
            valid = record.valid,
            counter = record.counter,
            status = ?record.activation_status,
            failed_attempts = record.failed_attempts,
            attributes = ?record.attributes,
            "{}",
            record.note
        );
        Ok(())
    }
}

/// Keeps audit records in memory
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    records: Mutex<Vec<SignatureAuditRecord>>,
}

impl MemoryAuditSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all records
    pub fn records(&self) -> Vec<SignatureAuditRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    /// Records of one activation
    pub fn records_for(&self, activation_id: Uuid) -> Vec<SignatureAuditRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.activation_id == activation_id)
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn record(&self, record: SignatureAuditRecord) -> Result<()> {
        if let Ok(mut records) = self.records.lock() {
            records.push(record);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(valid: bool) -> SignatureAuditRecord {
        SignatureAuditRecord {
            activation_id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            application_id: "a1".to_string(),
            signature_type: SignatureType::PossessionKnowledge,
            signature_version: 3,
            valid,
            counter: 1,
            activation_status: ActivationStatus::Active,
            failed_attempts: 0,
            note: "test".to_string(),
            attributes: BTreeMap::new(),
            timestamp: 0,
        }
    }

    #[tokio::test]
    async fn test_memory_sink_collects_records() {
        let sink = MemoryAuditSink::new();
        let first = record(true);
        sink.record(first.clone()).await.unwrap();
        sink.record(record(false)).await.unwrap();

        assert_eq!(sink.records().len(), 2);
        assert_eq!(sink.records_for(first.activation_id), vec![first]);
    }

    #[tokio::test]
    async fn test_tracing_sink_accepts_records() {
        TracingAuditSink.record(record(false)).await.unwrap();
    }
}
