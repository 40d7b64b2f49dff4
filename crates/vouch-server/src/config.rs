use anyhow::Result;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use vouch_core::ServiceConfig;

/// Storage engine backing the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageEngine {
    RocksDb,
    Memory,
}

impl FromStr for StorageEngine {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "rocksdb" => Ok(StorageEngine::RocksDb),
            "memory" => Ok(StorageEngine::Memory),
            other => anyhow::bail!("VOUCH_STORAGE_ENGINE must be rocksdb or memory, got {}", other),
        }
    }
}

/// Server configuration
#[derive(Clone)]
pub struct Config {
    /// Path to the RocksDB database
    pub database_path: PathBuf,

    pub storage_engine: StorageEngine,

    /// Wait before a row lock attempt gives up
    pub row_lock_timeout: Duration,

    /// Period of the housekeeping loop
    pub housekeeping_interval: Duration,

    /// Engine configuration handed to the service
    pub service: ServiceConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = ServiceConfig::default();

        let database_path = std::env::var("VOUCH_DATABASE_PATH")
            .unwrap_or_else(|_| "./data/vouch.db".to_string())
            .into();

        let storage_engine = env_or("VOUCH_STORAGE_ENGINE", StorageEngine::RocksDb)?;

        let master_db_encryption_key = match std::env::var("VOUCH_MASTER_DB_ENCRYPTION_KEY") {
            Ok(encoded) if !encoded.trim().is_empty() => {
                let key = STANDARD.decode(encoded.trim())?;
                if key.len() != 16 {
                    anyhow::bail!("VOUCH_MASTER_DB_ENCRYPTION_KEY must be 16 bytes (Base64)");
                }
                Some(key)
            }
            _ => None,
        };

        let service = ServiceConfig {
            master_db_encryption_key,
            max_failed_attempts: env_or("VOUCH_MAX_FAILED_ATTEMPTS", defaults.max_failed_attempts)?,
            activation_validity: Duration::from_secs(env_or(
                "VOUCH_ACTIVATION_VALIDITY_SECS",
                defaults.activation_validity.as_secs(),
            )?),
            signature_validation_lookahead: env_or(
                "VOUCH_SIGNATURE_LOOKAHEAD",
                defaults.signature_validation_lookahead,
            )?,
            offline_signature_component_length: env_or(
                "VOUCH_OFFLINE_COMPONENT_LENGTH",
                defaults.offline_signature_component_length,
            )?,
            vault_unlock_allow_biometry: env_or(
                "VOUCH_VAULT_UNLOCK_ALLOW_BIOMETRY",
                defaults.vault_unlock_allow_biometry,
            )?,
            request_timestamp_validity_ms: env_or(
                "VOUCH_REQUEST_TIMESTAMP_VALIDITY_MS",
                defaults.request_timestamp_validity_ms,
            )?,
            recovery_max_failed_attempts: env_or(
                "VOUCH_RECOVERY_MAX_FAILED_ATTEMPTS",
                defaults.recovery_max_failed_attempts,
            )?,
            recovery_max_puk_count: env_or("VOUCH_RECOVERY_MAX_PUK_COUNT", defaults.recovery_max_puk_count)?,
            temporary_key_validity: Duration::from_secs(env_or(
                "VOUCH_TEMPORARY_KEY_VALIDITY_SECS",
                defaults.temporary_key_validity.as_secs(),
            )?),
            ..defaults
        };

        let row_lock_timeout = Duration::from_millis(env_or("VOUCH_ROW_LOCK_TIMEOUT_MS", 10_000)?);
        let housekeeping_interval = Duration::from_secs(env_or("VOUCH_HOUSEKEEPING_INTERVAL_SECS", 60)?);
        if housekeeping_interval.is_zero() {
            anyhow::bail!("VOUCH_HOUSEKEEPING_INTERVAL_SECS must be positive");
        }

        Ok(Config {
            database_path,
            storage_engine,
            row_lock_timeout,
            housekeeping_interval,
            service,
        })
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Into<anyhow::Error>,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| Into::<anyhow::Error>::into(e).context(format!("invalid {}", name))),
        Err(_) => Ok(default),
    }
}
