pub mod db;
pub mod errors;
pub mod scanner;
pub mod settings;
pub mod utils;
pub mod websocket;

use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use axum::Router;
use log::{info, warn};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use db::Database;
use scanner::{PersistenceGuard, ScannerRegistry};
use settings::Settings;

#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub scanners: Arc<ScannerRegistry>,
    pub settings: Arc<Settings>,
}

impl AppState {
    /// Opens the database and wires the registry to it through one shared
    /// persistence guard.
    pub fn open(settings: Settings) -> Result<Self> {
        let db = Database::new(
            settings.database.path.clone(),
            settings.database.transaction_timeout(),
        )?;
        let guard = Arc::new(PersistenceGuard::from_settings(&settings.database));
        let scanners = Arc::new(ScannerRegistry::new(
            settings.scanner.clone(),
            Arc::new(db.clone()),
            guard,
        ));

        Ok(Self {
            db,
            scanners,
            settings: Arc::new(settings),
        })
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(scanner::commands::routes())
        .merge(websocket::routes())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Initialize logging (reads RUST_LOG, falling back to the configured level).
pub fn init_logging(level: Option<&str>) {
    let mut builder = env_logger::Builder::from_default_env();
    if std::env::var_os("RUST_LOG").is_none() {
        let filter = level
            .and_then(|level| level.parse::<log::LevelFilter>().ok())
            .unwrap_or(log::LevelFilter::Info);
        builder.filter_level(filter);
    }
    let _ = builder.try_init();
}

pub async fn serve(settings: Settings) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                settings.server.host, settings.server.port
            )
        })?;

    let state = AppState::open(settings)?;

    // Sessions still marked active belong to a previous process.
    let stale = state.db.mark_all_sessions_inactive().await?;
    if stale > 0 {
        warn!("Marked {stale} stale client sessions inactive");
    }

    let app = build_router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Scanhead listening on {addr}");

    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for ctrl-c: {err}");
                return;
            }
            info!("Shutdown requested");
            shutdown.cancel();
        });
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    info!("Scanhead stopped");
    Ok(())
}

pub fn run() -> Result<()> {
    let settings = Settings::load()?;
    init_logging(settings.log_level.as_deref());
    info!("Scanhead starting up...");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?
        .block_on(serve(settings))
}
