use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use facecheck_core::ChallengeMachine;

mod config;
mod dbus_interface;
mod engine;
mod frame;
mod http_detector;
mod locks;
mod service;
mod store;

use config::{Config, StoreKind};
use dbus_interface::{FaceCheckService, BUS_NAME, OBJECT_PATH};
use http_detector::HttpLandmarkDetector;
use service::LivenessService;
use store::{MemorySessionStore, SessionBackend, SqliteSessionStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facecheckd starting");

    let config = Config::from_env();

    let backend = match config.store {
        StoreKind::Sqlite => {
            let store = SqliteSessionStore::open(&config.db_path)
                .await
                .with_context(|| {
                    format!("failed to open session store at {}", config.db_path.display())
                })?;
            tracing::info!(path = %config.db_path.display(), "sqlite session store opened");
            SessionBackend::Sqlite(store)
        }
        StoreKind::Memory => {
            tracing::info!("in-memory session store selected");
            SessionBackend::Memory(MemorySessionStore::new())
        }
    };

    let detector =
        HttpLandmarkDetector::new(config.detector_url.clone(), config.detector_timeout());
    let engine = engine::spawn_engine(detector).context("failed to start landmark engine")?;
    tracing::info!(url = %config.detector_url, "landmark detector configured");

    let service = Arc::new(LivenessService::new(
        ChallengeMachine::new(config.machine_config()),
        backend.clone(),
        engine,
        config.session_ttl(),
        config.detector_timeout(),
    ));

    let purge_interval = Duration::from_secs(config.purge_interval_secs.max(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(purge_interval);
        loop {
            ticker.tick().await;
            match backend.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(removed, "purged expired sessions"),
                Err(e) => tracing::warn!(error = %e, "session purge failed"),
            }
        }
    });

    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, FaceCheckService { service })?
        .build()
        .await
        .context("failed to register on D-Bus")?;

    tracing::info!(
        bus = if config.session_bus { "session" } else { "system" },
        protocol_timeout_secs = config.protocol_timeout_secs,
        texture_guard = config.texture_guard_enabled,
        "facecheckd ready"
    );

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("facecheckd shutting down");

    Ok(())
}
