use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use rollcall_core::{AttendanceEngine, FaceLocator, ScrfdLocator, WholeFrameLocator};

mod config;
mod dbus_interface;
mod engine;
mod store;

use config::{Config, LocatorKind};
use dbus_interface::{RollcallService, BUS_NAME, OBJECT_PATH};
use engine::EngineHandle;
use store::SqliteStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = Config::from_env();
    tracing::info!(
        db = %config.db_path.display(),
        locator = ?config.locator,
        threshold = config.confidence_threshold,
        session_bus = config.session_bus,
        "rollcalld starting"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("opening {}", config.db_path.display()))?;

    let locator: Box<dyn FaceLocator> = match config.locator {
        LocatorKind::Scrfd => Box::new(ScrfdLocator::load(&config.scrfd_model_path())?),
        LocatorKind::WholeFrame => Box::new(WholeFrameLocator),
    };

    let engine = AttendanceEngine::new(store, locator, config.engine_settings());
    let restored = engine.restore_models()?;
    tracing::info!(classes = restored, "recognition models restored");

    let service = RollcallService::new(EngineHandle::new(engine), config.clone());
    let builder = if config.session_bus {
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };
    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on D-Bus")?;

    tracing::info!(name = BUS_NAME, path = OBJECT_PATH, "rollcalld ready");

    // Keep running until signaled
    tokio::signal::ctrl_c().await?;
    tracing::info!("rollcalld shutting down");

    Ok(())
}
