//! calcbridge orchestrator
//!
//! Owns the job dispatch queue and the lifecycle of per-bucket namespaces,
//! and runs the background worker that reaps finalized and idle namespaces.

use std::sync::Arc;

use anyhow::Result;
use calcbridge_jobs::{MemoryRecordStore, PriorityJobQueue, RecordStore, RedisRecordStore};
use calcbridge_orchestrator::{
    cleanup::{CleanupWorker, IndexPruneWorker},
    cluster::{ControlPlane, KubeClient, KubeConfig, MockControlPlane},
    config::Config,
    lifecycle::NamespaceLifecycleManager,
    state::AppState,
    storage::{BlobStore, ObjectStoreBlobs, StorageBackend},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CALCBRIDGE_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(dev_mode = config.dev_mode, platform = %config.platform, "Starting calcbridge orchestrator");

    let store: Arc<dyn RecordStore>;
    let cluster: Arc<dyn ControlPlane>;
    let blobs: Arc<dyn BlobStore>;

    if config.dev_mode {
        info!("Dev mode: using in-memory store, mock cluster, and memory blobs");
        store = Arc::new(MemoryRecordStore::new());
        cluster = Arc::new(MockControlPlane::new());
        blobs = Arc::new(ObjectStoreBlobs::new(StorageBackend::Memory));
    } else {
        store = match RedisRecordStore::connect(&config.redis_url).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                error!(error = %e, "Failed to connect to record store");
                return Err(e.into());
            }
        };

        let kube = KubeConfig::from_files(
            config.kube.api_url.clone(),
            &config.kube.token_file,
            &config.kube.ca_file,
        );
        cluster = Arc::new(KubeClient::new(&kube)?);
        info!(api_url = %config.kube.api_url, "Cluster client configured");

        let store = ObjectStoreBlobs::new(config.storage.clone());
        if let Err(e) = store.ensure_container(&config.diagnostics_container).await {
            error!(
                container = %config.diagnostics_container,
                error = %e,
                "Diagnostics container is not usable"
            );
            return Err(e.into());
        }
        info!(container = %config.diagnostics_container, "Diagnostics container ready");
        blobs = Arc::new(store);
    }

    let lifecycle = Arc::new(NamespaceLifecycleManager::new(
        cluster,
        blobs,
        config.lifecycle(),
    ));
    let state = AppState::new(
        PriorityJobQueue::new(store),
        lifecycle.clone(),
        config.stream_base_url.clone(),
    );

    match state.queue().queue_depth().await {
        Ok(depth) => info!(queue_depth = depth, "Job queue ready"),
        Err(e) => warn!(error = %e, "Could not read job queue depth"),
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let prune_worker = IndexPruneWorker::new(state.queue().clone(), config.cleanup_interval);
    let prune_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            prune_worker.run(shutdown_rx).await;
        }
    });

    let cleanup_worker = CleanupWorker::new(lifecycle, config.cleanup());
    let cleanup_handle = tokio::spawn(async move {
        cleanup_worker.run(shutdown_rx).await;
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
    } else {
        info!("Received shutdown signal");
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    match tokio::time::timeout(shutdown_timeout, prune_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Index prune worker panicked"),
        Err(e) => warn!(error = %e, "Index prune worker did not shut down in time"),
    }

    match tokio::time::timeout(shutdown_timeout, cleanup_handle).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(error = %e, "Cleanup worker panicked"),
        Err(e) => warn!(error = %e, "Cleanup worker did not shut down in time"),
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
