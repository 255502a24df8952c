mod config;
mod conn;
mod db;
mod history;
mod mqtt;
mod provision;
mod reconcile;
mod router;
mod state;
mod timesvc;
mod web;

use anyhow::Result;
use std::{env, sync::Arc};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use conn::ConnectionManager;
use db::Db;
use state::HubState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // ── Config ──────────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let settings = Arc::new(config::load(&config_path)?);
    info!(
        broker = %settings.mqtt.host,
        port = settings.mqtt.port,
        topic = %settings.mqtt.topic,
        "configuration loaded"
    );

    // ── Database ────────────────────────────────────────────────────
    let db_url =
        env::var("DB_URL").unwrap_or_else(|_| "sqlite:fieldbus.db?mode=rwc".to_string());
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    let boards = db.list_controllers().await?;
    info!(boards = boards.len(), "db ready");

    // ── Shared state ────────────────────────────────────────────────
    let shared = HubState::shared();

    // ── Bus ─────────────────────────────────────────────────────────
    let (manager, bus) =
        ConnectionManager::new(Arc::clone(&settings), db.clone(), Arc::clone(&shared));
    let (stop_tx, stop_rx) = watch::channel(false);
    let consume = tokio::spawn(manager.run(stop_rx));

    // ── Web server ──────────────────────────────────────────────────
    let app = web::AppState {
        db,
        bus,
        shared,
        settings: Arc::clone(&settings),
    };
    tokio::spawn(async move {
        web::serve(app).await;
    });

    // ── Shutdown ────────────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, stopping");
    if stop_tx.send(true).is_err() {
        warn!("consume loop already gone");
    }
    consume.await?;
    info!("bye");
    Ok(())
}
