//! PageWarden - Website availability and defacement monitoring pipeline.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pagewarden::alert::AlertEngine;
use pagewarden::blob::BlobStore;
use pagewarden::capture::{CaptureConfig, Capturer};
use pagewarden::config::Config;
use pagewarden::db::Store;
use pagewarden::events::Publisher;
use pagewarden::scheduler::{JobQueue, RetentionManager, Scheduler, Workers};

/// Running jobs older than this at startup are presumed orphaned by a crash
/// and requeued.
const JOB_LEASE_MINS: i64 = 10;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pagewarden=info".parse()?),
        )
        .init();

    let cfg = Config::load()?;
    tracing::info!("Starting PageWarden");
    tracing::info!("Using database at {}", cfg.db_path);

    let store = Store::new(&cfg.db_path)?;
    let blobs = BlobStore::open(&cfg.blob_root)?;
    tracing::info!("Database and blob store initialized");

    let capturer = Arc::new(
        Capturer::launch(CaptureConfig {
            viewport_width: cfg.viewport_width,
            viewport_height: cfg.viewport_height,
            nav_timeout: std::time::Duration::from_secs(cfg.capture_timeout_secs),
            min_bytes: cfg.min_capture_bytes,
            ..CaptureConfig::default()
        })
        .await?,
    );
    tracing::info!("Headless browser launched");

    let publisher = Publisher::new(256);
    let queue = JobQueue::new(store.clone());

    // A restart must not strand claimed work.
    queue.recover(chrono::Duration::minutes(JOB_LEASE_MINS))?;

    let alerts = Arc::new(AlertEngine::new(store.clone(), publisher.clone()));
    let workers = Workers::new(
        store.clone(),
        queue.clone(),
        blobs.clone(),
        publisher.clone(),
        capturer.clone(),
        alerts,
        cfg.clone(),
    )?;
    workers.start();

    let retention = RetentionManager::new(store.clone(), blobs.clone(), cfg.retention_days);
    retention.start();

    let scheduler = Scheduler::new(store, queue, publisher, cfg);
    scheduler.start().await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    scheduler.shutdown().await;
    workers.stop();
    retention.stop();
    capturer.shutdown().await;

    Ok(())
}
