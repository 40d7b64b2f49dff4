//! Test helpers: engine setup and a simulated device.

#![allow(dead_code)]

use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;
use vouch_core::envelope::EnvelopeScope;
use vouch_core::*;
use vouch_crypto::{
    compute_signature, next_ctr_data, numeric_ctr_data, sha256, ActivationKeys, EciesSession, KeyPair, SignatureType,
    ONLINE_COMPONENT_LENGTH,
};
use vouch_storage::{MemoryStorage, Storage};

pub const TEST_MASTER_KEY: [u8; 16] = [7u8; 16];

pub type TestService<S = MemoryStorage> = VouchService<S, MemoryAuditSink>;

/// Engine under test with handles on its storage and audit trail
pub struct TestEngine<S: Storage = MemoryStorage> {
    pub service: Arc<TestService<S>>,
    pub storage: Arc<S>,
    pub audit: Arc<MemoryAuditSink>,
}

/// Default config with at-rest encryption on
pub fn test_config() -> ServiceConfig {
    ServiceConfig {
        master_db_encryption_key: Some(TEST_MASTER_KEY.to_vec()),
        ..Default::default()
    }
}

/// Helper to create an engine over in-memory storage
pub fn create_test_engine(config: ServiceConfig) -> TestEngine {
    create_test_engine_with(Arc::new(MemoryStorage::new()), config)
}

/// Helper to create an engine over any storage
pub fn create_test_engine_with<S: Storage + 'static>(storage: Arc<S>, config: ServiceConfig) -> TestEngine<S> {
    let audit = Arc::new(MemoryAuditSink::new());
    let service = Arc::new(VouchService::new(
        Arc::clone(&storage),
        Arc::clone(&audit),
        config,
    ));
    TestEngine {
        service,
        storage,
        audit,
    }
}

/// Helper to create a test application
pub async fn create_test_application<S: Storage + 'static>(engine: &TestEngine<S>) -> Application {
    engine
        .service
        .create_application(format!("app-{}", Uuid::new_v4()))
        .await
        .unwrap()
}

/// Client side of the protocol
pub struct Device {
    pub key_pair: KeyPair,
    pub application: Application,
    pub activation_id: Option<Uuid>,
    pub server_public_key: Vec<u8>,
    pub ctr_data: Vec<u8>,
    pub counter: u64,
    pub protocol: u8,
    pub recovery: Option<ActivationRecovery>,
}

impl Device {
    pub fn new(application: &Application) -> Self {
        Self {
            key_pair: KeyPair::generate(),
            application: application.clone(),
            activation_id: None,
            server_public_key: Vec::new(),
            ctr_data: Vec::new(),
            counter: 0,
            protocol: 3,
            recovery: None,
        }
    }

    /// Device that announces protocol 2 on key exchange
    pub fn legacy(application: &Application) -> Self {
        Self {
            protocol: 2,
            ..Self::new(application)
        }
    }

    /// Encrypt a payload to a recipient key in a scope
    pub fn seal<T: Serialize>(
        &self,
        scope: EnvelopeScope,
        recipient_public_key: &[u8],
        payload: &T,
    ) -> (EncryptedRequest, EciesSession) {
        let plaintext = serde_json::to_vec(payload).unwrap();
        let (envelope, session) = EciesSession::seal_request(
            recipient_public_key,
            scope.shared_info1(),
            &sha256(self.application.application_secret.as_bytes()),
            &plaintext,
        )
        .unwrap();

        let request = EncryptedRequest {
            application_key: self.application.application_key.clone(),
            temporary_key_id: None,
            envelope,
        };
        (request, session)
    }

    pub fn key_exchange_payload(&self, otp: Option<&str>) -> KeyExchangePayload {
        KeyExchangePayload {
            device_public_key: self.key_pair.public_key_bytes(),
            activation_name: Some("test phone".to_string()),
            platform: Some("ios".to_string()),
            device_info: None,
            activation_otp: otp.map(str::to_string),
            protocol_version: Some(self.protocol),
        }
    }

    /// Key exchange envelope for the application master key
    pub fn key_exchange_request(&self, otp: Option<&str>) -> (EncryptedRequest, EciesSession) {
        self.seal(
            EnvelopeScope::ActivationKeyExchange,
            &self.application.master_public_key,
            &self.key_exchange_payload(otp),
        )
    }

    /// Envelope for the activation's server key
    pub fn activation_request<T: Serialize>(&self, scope: EnvelopeScope, payload: &T) -> (EncryptedRequest, EciesSession) {
        self.seal(scope, &self.server_public_key, payload)
    }

    /// Read the key exchange response
    pub fn complete_key_exchange(&mut self, response: &ActivationKeyExchangeResponse, session: &EciesSession) {
        let plaintext = session.open_response(&response.encrypted_response).unwrap();
        let payload: KeyExchangeResponsePayload = serde_json::from_slice(&plaintext).unwrap();

        assert_eq!(payload.activation_id, response.activation_id);
        self.activation_id = Some(payload.activation_id);
        self.server_public_key = payload.server_public_key;
        self.ctr_data = payload.ctr_data;
        self.counter = 0;
        self.recovery = payload.activation_recovery;
        if self.ctr_data.is_empty() {
            self.protocol = 2;
        }
    }

    pub fn activation_id(&self) -> Uuid {
        self.activation_id.unwrap()
    }

    pub fn keys(&self) -> ActivationKeys {
        let master_secret = self.key_pair.diffie_hellman(&self.server_public_key).unwrap();
        ActivationKeys::derive(&master_secret[..]).unwrap()
    }

    /// Sign with the current counter and move it on
    pub fn sign(&mut self, signature_type: SignatureType, data: &[u8]) -> String {
        self.sign_with_length(signature_type, data, ONLINE_COMPONENT_LENGTH)
    }

    pub fn sign_with_length(&mut self, signature_type: SignatureType, data: &[u8], component_length: usize) -> String {
        let ctr_data = match self.protocol {
            2 => numeric_ctr_data(self.counter).to_vec(),
            _ => self.ctr_data.clone(),
        };
        let signature = compute_signature(&self.keys(), signature_type, &ctr_data, data, component_length).unwrap();
        self.advance();
        signature
    }

    /// Skip one counter position, as a signature computed but never sent would
    pub fn advance(&mut self) {
        self.counter += 1;
        if self.protocol == 3 {
            self.ctr_data = next_ctr_data(&self.ctr_data).to_vec();
        }
    }
}

/// Init, key exchange and commit in one go
pub async fn activate_device<S: Storage + 'static>(
    engine: &TestEngine<S>,
    application: &Application,
    user_id: &str,
) -> Device {
    activate_with(engine, Device::new(application), user_id).await
}

pub async fn activate_with<S: Storage + 'static>(engine: &TestEngine<S>, mut device: Device, user_id: &str) -> Device {
    let init = engine
        .service
        .init_activation(InitActivationRequest {
            application_id: device.application.application_id.clone(),
            user_id: user_id.to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    let (encrypted, session) = device.key_exchange_request(None);
    let response = engine
        .service
        .prepare_activation(PrepareActivationRequest {
            activation_code: init.activation_code,
            encrypted,
        })
        .await
        .unwrap();
    device.complete_key_exchange(&response, &session);

    let status = engine
        .service
        .commit_activation(device.activation_id(), None, None)
        .await
        .unwrap();
    assert_eq!(status.status, ActivationStatus::Active);
    device
}

/// Online verification request for a signature the device just made
pub fn verify_request(device: &Device, signature_type: SignatureType, data: &[u8], signature: String) -> VerifySignatureRequest {
    VerifySignatureRequest {
        activation_id: device.activation_id(),
        application_key: device.application.application_key.clone(),
        data: data.to_vec(),
        signature,
        signature_type,
        forced_signature_version: None,
    }
}
