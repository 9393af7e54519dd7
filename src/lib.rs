//! adsentry -- rule-based anomaly detection over daily campaign metrics.
//!
//! This crate provides the detection engine, its SQLite storage, the HTTP
//! trigger and workflow API, and a cron-driven detection loop.

pub mod api;
pub mod config;
pub mod detect;
pub mod scheduler;
pub mod storage;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use crate::config::{AppConfig, LogFormat, LoggingConfig};

/// Install the global tracing subscriber. `RUST_LOG` wins over the
/// configured level.
pub fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr);

    match logging.format {
        LogFormat::Pretty => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Start the adsentry daemon: API server and, when configured, the
/// detection schedule.
pub async fn serve(config: AppConfig) -> Result<()> {
    // 1. Initialize Storage
    let db_path = &config.storage.database_path;
    tracing::info!(%db_path, "Initializing database");
    let store = storage::SqliteStore::open(db_path)?;

    let runner = scheduler::DetectionRunner::new(store, config.detection.options());

    // 2. Start the detection schedule (background task)
    if let Some(expr) = &config.detection.schedule {
        let schedule = scheduler::parse_schedule(expr)?;
        let scheduled = runner.clone();
        tokio::spawn(async move {
            scheduler::run_schedule_loop(scheduled, schedule).await;
        });
    }

    // 3. Start API Server
    let addr: std::net::SocketAddr = config
        .server
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.server.bind))?;
    let app = api::router(api::state::AppState::new(runner));

    tracing::info!(%addr, "adsentry listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
