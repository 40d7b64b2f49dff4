use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vouch_core::{ActivationEngine, TracingAuditSink, VouchService};
use vouch_storage::{MemoryStorage, RocksDbStorage, Storage};

mod config;

use config::{Config, StorageEngine};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vouch=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    if config.service.master_db_encryption_key.is_none() {
        tracing::warn!("No master DB encryption key configured, secrets are stored unencrypted");
    }

    match config.storage_engine {
        StorageEngine::RocksDb => {
            tracing::info!("Opening RocksDB at {}", config.database_path.display());
            let storage = RocksDbStorage::open_with_lock_timeout(&config.database_path, config.row_lock_timeout)?;
            run(Arc::new(storage), config).await
        }
        StorageEngine::Memory => {
            tracing::warn!("Using in-memory storage, state is lost on shutdown");
            let storage = MemoryStorage::new().with_lock_timeout(config.row_lock_timeout);
            run(Arc::new(storage), config).await
        }
    }
}

async fn run<S: Storage + 'static>(storage: Arc<S>, config: Config) -> Result<()> {
    let interval = config.housekeeping_interval;
    let service = Arc::new(VouchService::new(storage, Arc::new(TracingAuditSink), config.service));
    tracing::info!("vouch engine started, housekeeping every {}s", interval.as_secs());

    let mut ticker = tokio::time::interval(interval);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = ticker.tick() => housekeeping(service.as_ref()).await,
            _ = &mut shutdown => break,
        }
    }

    Ok(())
}

async fn housekeeping<E: ActivationEngine>(engine: &E) {
    match engine.expire_pending_activations().await {
        Ok(0) => {}
        Ok(count) => tracing::info!("Expired {} pending activations", count),
        Err(e) => tracing::error!("Expiring pending activations failed: {}", e),
    }

    match engine.purge_expired_temporary_keys().await {
        Ok(0) => {}
        Ok(count) => tracing::info!("Purged {} expired temporary keys", count),
        Err(e) => tracing::error!("Purging temporary keys failed: {}", e),
    }

    match engine.purge_used_nonces().await {
        Ok(0) => {}
        Ok(count) => tracing::debug!("Purged {} used envelope nonces", count),
        Err(e) => tracing::error!("Purging used nonces failed: {}", e),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Graceful shutdown initiated");
}
