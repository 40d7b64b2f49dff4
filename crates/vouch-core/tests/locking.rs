mod common;

use common::*;
use std::sync::Arc;
use uuid::Uuid;
use vouch_core::*;
use vouch_crypto::SignatureType;
use vouch_storage::{RocksDbStorage, Storage, CF_ACTIVATIONS};

#[tokio::test]
async fn test_concurrent_failures_are_serialized() {
    let engine = create_test_engine(ServiceConfig {
        max_failed_attempts: 50,
        ..test_config()
    });
    let application = create_test_application(&engine).await;
    let device = activate_device(&engine, &application, "u1").await;

    let mut handles = Vec::new();
    for _ in 0..20 {
        let service = Arc::clone(&engine.service);
        let request = verify_request(
            &device,
            SignatureType::PossessionKnowledge,
            b"payload",
            "00000000-00000000".to_string(),
        );
        handles.push(tokio::spawn(async move { service.verify_signature(request).await }));
    }
    for handle in handles {
        let response = handle.await.unwrap().unwrap();
        assert!(!response.signature_valid);
    }

    let activation: Activation = engine
        .storage
        .get(CF_ACTIVATIONS, &device.activation_id())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(activation.failed_attempts, 20);
    assert_eq!(activation.counter, 20);
    assert_eq!(activation.status, ActivationStatus::Active);
}

#[tokio::test]
async fn test_full_flow_on_rocksdb() {
    let storage = Arc::new(RocksDbStorage::open_test().unwrap());
    let engine = create_test_engine_with(storage, test_config());
    let application = create_test_application(&engine).await;
    let mut device = activate_device(&engine, &application, "u1").await;

    let signature = device.sign(SignatureType::PossessionKnowledge, b"payload");
    let response = engine
        .service
        .verify_signature(verify_request(
            &device,
            SignatureType::PossessionKnowledge,
            b"payload",
            signature,
        ))
        .await
        .unwrap();
    assert!(response.signature_valid);

    let activations = engine.service.list_activations("u1".to_string(), None).await.unwrap();
    assert_eq!(activations.len(), 1);
}

#[tokio::test]
async fn test_probing_unknown_ids_on_rocksdb_takes_no_locks() {
    let storage = Arc::new(RocksDbStorage::open_test().unwrap());
    let engine = create_test_engine_with(Arc::clone(&storage), test_config());
    let before = storage.row_locks().slot_count();

    for _ in 0..10 {
        let err = engine
            .service
            .block_activation(Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACTIVATION_NOT_FOUND");
    }
    assert_eq!(storage.row_locks().slot_count(), before);
}

#[tokio::test]
async fn test_probing_unknown_ids_in_memory_locks_each_row() {
    let engine = create_test_engine(test_config());
    let before = engine.storage.row_locks().slot_count();

    for _ in 0..10 {
        let err = engine
            .service
            .block_activation(Uuid::new_v4(), None, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ACTIVATION_NOT_FOUND");
    }
    assert_eq!(engine.storage.row_locks().slot_count(), before + 10);
}
