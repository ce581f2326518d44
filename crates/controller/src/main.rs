//! VPA controller - vertical resource recommender and updater
//!
//! Reads cluster state from a snapshot file, keeps decaying usage
//! histograms per container, publishes recommendations and evicts pods
//! whose requests drifted from them.

use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use vpa_lib::{
    checkpoint::FileCheckpointStore,
    health::HealthRegistry,
    observability::{ControllerMetrics, StructuredLogger},
    recommender::{OomObserver, Recommender, RecommenderSources},
    sources::{FileStatusWriter, LoggingEvictionClient, SnapshotSource},
    updater::Updater,
};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting vpa-controller");

    let config = config::ControllerConfig::load()?;
    info!(
        snapshot = %config.snapshot_path.display(),
        checkpoints = %config.checkpoint_dir.display(),
        status = %config.status_dir.display(),
        memory_saver_mode = config.memory_saver_mode,
        "Controller configured"
    );

    let health_registry = HealthRegistry::new();
    health_registry.register_all().await;

    let metrics = ControllerMetrics::new();
    let logger = StructuredLogger::new("controller");
    logger.log_startup(CONTROLLER_VERSION);

    let snapshot = Arc::new(
        SnapshotSource::from_file(&config.snapshot_path).with_status_dir(&config.status_dir),
    );
    let sources = RecommenderSources {
        cluster: snapshot.clone(),
        metrics: snapshot.clone(),
        checkpoints: Arc::new(FileCheckpointStore::new(&config.checkpoint_dir)),
        status: Arc::new(FileStatusWriter::new(&config.status_dir)),
    };

    let recommender_config = config.recommender_config();
    let oom_poll_interval = recommender_config.oom_poll_interval;
    let (oom_observer, oom_rx) =
        OomObserver::new(recommender_config.oom_channel_capacity, metrics.clone());

    let mut recommender =
        Recommender::new(recommender_config, sources, oom_rx, health_registry.clone());
    recommender.init(Utc::now()).await;
    if config.init_from_history {
        recommender.init_from_history(snapshot.as_ref(), Utc::now()).await;
    }

    let (shutdown_tx, _) = broadcast::channel(1);
    let mut handles = Vec::new();

    handles.push(tokio::spawn(recommender.run(shutdown_tx.subscribe())));
    handles.push(tokio::spawn(oom_observer.run(
        snapshot.clone(),
        oom_poll_interval,
        shutdown_tx.subscribe(),
    )));

    if config.enable_updater {
        let updater = Updater::new(
            config.updater_config(),
            snapshot.clone(),
            snapshot.clone(),
            Arc::new(LoggingEvictionClient::new()),
            health_registry.clone(),
        );
        handles.push(tokio::spawn(updater.run(shutdown_tx.subscribe())));
    } else {
        info!("Updater disabled");
    }

    // Start health and metrics server
    let app_state = Arc::new(api::AppState::new(health_registry.clone(), metrics));
    let api_port = config.api_port;
    tokio::spawn(async move {
        if let Err(e) = api::serve(api_port, app_state).await {
            warn!(error = %e, "API server stopped");
        }
    });

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    logger.log_shutdown("SIGINT received");
    let _ = shutdown_tx.send(());

    for handle in handles {
        if let Err(e) = handle.await {
            warn!(error = %e, "Loop task failed");
        }
    }
    info!("Shutdown complete");

    Ok(())
}
