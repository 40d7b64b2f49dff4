use crate::envelope::{shared_info2, EnvelopeScope};
use crate::*;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;
use vouch_crypto::{current_timestamp_millis, sha256, verify_ecdsa, EciesSession, KeyPair};
use vouch_storage::{MemoryStorage, Storage, CF_ACTIVATIONS, CF_TEMPORARY_KEYS, CF_USED_NONCES};

type TestService = VouchService<MemoryStorage, MemoryAuditSink>;

// Helper to create a service over fresh in-memory storage
fn create_test_service(master_key: Option<&[u8]>) -> (Arc<TestService>, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let config = ServiceConfig {
        master_db_encryption_key: master_key.map(<[u8]>::to_vec),
        ..Default::default()
    };
    (create_service_over(Arc::clone(&storage), config), storage)
}

// Helper to create a service over existing storage
fn create_service_over(storage: Arc<MemoryStorage>, config: ServiceConfig) -> Arc<TestService> {
    Arc::new(VouchService::new(storage, Arc::new(MemoryAuditSink::new()), config))
}

// Helper to create an application and a CREATED activation
async fn create_initialized_activation(service: &TestService) -> (Application, InitActivationResponse) {
    let application = service
        .create_application(format!("app-{}", Uuid::new_v4()))
        .await
        .unwrap();
    let init = service
        .init_activation(InitActivationRequest {
            application_id: application.application_id.clone(),
            user_id: "alice".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    (application, init)
}

// Helper to seal a key exchange payload to any recipient key
fn seal_key_exchange(
    application: &Application,
    recipient_public_key: &[u8],
    temporary_key_id: Option<String>,
    otp: Option<&str>,
) -> EncryptedRequest {
    let device = KeyPair::generate();
    let payload = KeyExchangePayload {
        device_public_key: device.public_key_bytes(),
        activation_name: None,
        platform: None,
        device_info: None,
        activation_otp: otp.map(str::to_string),
        protocol_version: None,
    };
    let (envelope, _) = EciesSession::seal_request(
        recipient_public_key,
        EnvelopeScope::ActivationKeyExchange.shared_info1(),
        &shared_info2(application),
        &serde_json::to_vec(&payload).unwrap(),
    )
    .unwrap();

    EncryptedRequest {
        application_key: application.application_key.clone(),
        temporary_key_id,
        envelope,
    }
}

async fn stored_activation(storage: &MemoryStorage, activation_id: Uuid) -> Activation {
    storage.get(CF_ACTIVATIONS, &activation_id).await.unwrap().unwrap()
}

#[tokio::test]
async fn test_server_private_key_encrypted_at_rest() {
    let (service, storage) = create_test_service(Some(&[9u8; 16][..]));
    assert!(service.encrypts_secrets());

    let (_, init) = create_initialized_activation(&service).await;
    let activation = stored_activation(&storage, init.activation_id).await;

    assert_eq!(activation.server_private_key.encryption_mode, EncryptionMode::AesHmac);
    let key_pair = service.server_key_pair(&activation).unwrap();
    assert_eq!(key_pair.public_key_bytes(), activation.server_public_key);
}

#[tokio::test]
async fn test_server_private_key_plain_without_master_key() {
    let (service, storage) = create_test_service(None);

    let (_, init) = create_initialized_activation(&service).await;
    let activation = stored_activation(&storage, init.activation_id).await;

    assert_eq!(
        activation.server_private_key.encryption_mode,
        EncryptionMode::NoEncryption
    );
    assert_eq!(activation.server_private_key.payload.len(), 32);
}

#[tokio::test]
async fn test_encrypted_record_needs_master_key() {
    let (service, storage) = create_test_service(Some(&[9u8; 16][..]));
    let (_, init) = create_initialized_activation(&service).await;

    // Same data, key missing from the configuration
    let unkeyed = create_service_over(Arc::clone(&storage), ServiceConfig::default());
    let activation = stored_activation(&storage, init.activation_id).await;
    let err = unkeyed.server_key_pair(&activation).unwrap_err();
    assert_eq!(err.code(), "MISSING_MASTER_DB_ENCRYPTION_KEY");

    // Wrong key: a different record key is derived
    let rekeyed = create_service_over(
        Arc::clone(&storage),
        ServiceConfig {
            master_db_encryption_key: Some(vec![1u8; 16]),
            ..Default::default()
        },
    );
    let recovered = rekeyed.server_key_pair(&activation);
    assert!(recovered.map_or(true, |key| key.public_key_bytes() != activation.server_public_key));
}

#[tokio::test]
async fn test_plain_records_stay_readable_after_key_introduced() {
    let (service, storage) = create_test_service(None);
    let (_, init) = create_initialized_activation(&service).await;

    let keyed = create_service_over(
        Arc::clone(&storage),
        ServiceConfig {
            master_db_encryption_key: Some(vec![3u8; 16]),
            ..Default::default()
        },
    );
    let activation = stored_activation(&storage, init.activation_id).await;
    let key_pair = keyed.server_key_pair(&activation).unwrap();
    assert_eq!(key_pair.public_key_bytes(), activation.server_public_key);
}

#[tokio::test]
async fn test_create_activation_otp_failure_leaves_nothing() {
    let (service, storage) = create_test_service(None);
    let application = service.create_application("bank".to_string()).await.unwrap();

    let encrypted = seal_key_exchange(&application, &application.master_public_key, None, Some("00000"));
    let replay_key = (
        encrypted.envelope.ephemeral_public_key.clone(),
        encrypted.envelope.nonce.clone(),
    );
    let err = service
        .create_activation(CreateActivationRequest {
            user_id: "alice".to_string(),
            max_failed_attempts: None,
            expires_at: None,
            otp_validation: OtpValidation::OnKeyExchange,
            otp: Some("12345".to_string()),
            encrypted,
        })
        .await
        .unwrap_err();

    assert_eq!(err.code(), "INVALID_ACTIVATION_OTP");
    assert!(!err.requires_rollback());
    assert!(service
        .list_activations("alice".to_string(), None)
        .await
        .unwrap()
        .is_empty());
    assert!(!storage.exists(CF_USED_NONCES, &replay_key).await.unwrap());
}

#[tokio::test]
async fn test_temporary_key_signed_by_master_key() {
    let (service, storage) = create_test_service(Some(&[9u8; 16][..]));
    let application = service.create_application("bank".to_string()).await.unwrap();

    let key = service
        .create_temporary_key(application.application_key.clone(), None)
        .await
        .unwrap();
    assert!(key.expires_at > current_timestamp_millis());

    let stored: TemporaryKey = storage.get(CF_TEMPORARY_KEYS, &key.key_id).await.unwrap().unwrap();
    assert_eq!(stored.private_key.encryption_mode, EncryptionMode::AesHmac);
    verify_ecdsa(
        &application.master_public_key,
        format!("{}\n{}\n{}", key.key_id, STANDARD.encode(&key.public_key), key.expires_at).as_bytes(),
        &key.signature,
    )
    .unwrap();

    assert!(service.remove_temporary_key(key.key_id.clone()).await.unwrap());
    assert!(!service.remove_temporary_key(key.key_id).await.unwrap());
}

#[tokio::test]
async fn test_temporary_key_requires_active_activation() {
    let (service, _) = create_test_service(None);
    let (application, init) = create_initialized_activation(&service).await;

    let err = service
        .create_temporary_key(application.application_key.clone(), Some(init.activation_id))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::StateConflict);

    let err = service
        .create_temporary_key(application.application_key, Some(Uuid::new_v4()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_envelope_encrypted_to_temporary_key() {
    let (service, _) = create_test_service(Some(&[9u8; 16][..]));
    let application = service.create_application("bank".to_string()).await.unwrap();
    let key = service
        .create_temporary_key(application.application_key.clone(), None)
        .await
        .unwrap();

    let encrypted = seal_key_exchange(&application, &key.public_key, Some(key.key_id.clone()), None);
    let response = service
        .create_activation(CreateActivationRequest {
            user_id: "alice".to_string(),
            max_failed_attempts: None,
            expires_at: None,
            otp_validation: OtpValidation::None,
            otp: None,
            encrypted,
        })
        .await
        .unwrap();
    assert_eq!(response.activation_status, ActivationStatus::PendingCommit);

    // A key that does not exist is reported as such
    let encrypted = seal_key_exchange(&application, &key.public_key, Some("missing".to_string()), None);
    let err = service
        .create_activation(CreateActivationRequest {
            user_id: "alice".to_string(),
            max_failed_attempts: None,
            expires_at: None,
            otp_validation: OtpValidation::None,
            otp: None,
            encrypted,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TEMPORARY_KEY_NOT_FOUND");
}

#[tokio::test]
async fn test_purge_expired_temporary_keys() {
    let storage = Arc::new(MemoryStorage::new());
    let service = create_service_over(
        Arc::clone(&storage),
        ServiceConfig {
            temporary_key_validity: Duration::ZERO,
            ..Default::default()
        },
    );
    let application = service.create_application("bank".to_string()).await.unwrap();
    let key = service
        .create_temporary_key(application.application_key, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(5)).await;

    assert_eq!(service.purge_expired_temporary_keys().await.unwrap(), 1);
    assert!(!storage.exists(CF_TEMPORARY_KEYS, &key.key_id).await.unwrap());
}

#[tokio::test]
async fn test_purge_used_nonces() {
    let (service, storage) = create_test_service(None);
    let stale = (vec![1u8; 33], vec![1u8; 16]);
    let fresh = (vec![2u8; 33], vec![2u8; 16]);
    storage
        .put(CF_USED_NONCES, &stale, &UsedNonce { expires_at: 0 })
        .await
        .unwrap();
    storage
        .put(
            CF_USED_NONCES,
            &fresh,
            &UsedNonce {
                expires_at: current_timestamp_millis() + 60_000,
            },
        )
        .await
        .unwrap();

    assert_eq!(service.purge_used_nonces().await.unwrap(), 1);
    assert!(!storage.exists(CF_USED_NONCES, &stale).await.unwrap());
    assert!(storage.exists(CF_USED_NONCES, &fresh).await.unwrap());
}

#[tokio::test]
async fn test_shared_info_binds_application_secret() {
    let (service, _) = create_test_service(None);
    let application = service.create_application("bank".to_string()).await.unwrap();

    assert_eq!(
        shared_info2(&application),
        sha256(application.application_secret.as_bytes())
    );
}

#[tokio::test]
async fn test_unsupported_application_rejected_by_key() {
    let (service, _) = create_test_service(None);
    let application = service.create_application("bank".to_string()).await.unwrap();

    service
        .set_application_supported(application.application_id.clone(), false)
        .await
        .unwrap();
    let err = service
        .application_by_key(&application.application_key)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_APPLICATION");

    let err = service.application_by_key("unknown").await.unwrap_err();
    assert_eq!(err.code(), "INVALID_APPLICATION");
}

#[tokio::test]
async fn test_empty_application_name_rejected() {
    let (service, _) = create_test_service(None);

    let err = service.create_application("  ".to_string()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidRequest);
}
