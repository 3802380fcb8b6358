use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Mutex, RwLock};
use tracing_subscriber::EnvFilter;

use passage_core::AccessEngine;

mod config;
mod dbus_interface;
mod rate_limiter;
mod sessions;
mod store;

use config::Config;
use dbus_interface::{AppState, PassageService};
use rate_limiter::AttemptLimiter;
use sessions::SessionRegistry;
use store::AccessStore;

const BUS_NAME: &str = "org.passage.Access1";
const OBJECT_PATH: &str = "/org/passage/Access1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("passaged starting");

    let cfg = Config::from_env();

    let store = AccessStore::open(&cfg.db_path)
        .await
        .with_context(|| format!("opening database at {}", cfg.db_path.display()))?;

    let engine = AccessEngine::open(cfg.engine.clone(), &cfg.index_path)
        .with_context(|| format!("opening identity index at {}", cfg.index_path.display()))?;
    tracing::info!(
        enrolled = engine.stats().enrolled,
        vectors = engine.stats().total_vectors,
        "decision engine ready"
    );

    let sessions = SessionRegistry::new(
        cfg.engine.liveness.clone(),
        Duration::from_secs(cfg.session_idle_secs),
    );
    let session_bus = cfg.session_bus;

    let service = PassageService {
        engine: Arc::new(RwLock::new(engine)),
        state: Arc::new(Mutex::new(AppState {
            config: cfg,
            store,
            rate_limiter: AttemptLimiter::new(),
            sessions,
        })),
    };

    let builder = if session_bus {
        tracing::info!("connecting to session bus (development mode)");
        zbus::connection::Builder::session()?
    } else {
        zbus::connection::Builder::system()?
    };

    let _conn = builder
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering D-Bus service")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "passaged ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("passaged shutting down");

    Ok(())
}
