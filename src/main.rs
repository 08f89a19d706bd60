//! Application entry point for the `lidarflow` backend service.
//!
//! Startup sequence:
//! - Initialize structured logging/tracing
//! - Load configuration from environment variables or `.env`
//! - Open the configured store (PostgreSQL pool + schema, or in-memory)
//! - Seed owners listed in `SEED_OWNERS`
//! - Start the raw device listener and the stale-measurement sweep
//! - Mount all HTTP/WebSocket routes via the `routes` gateway (EMBP) and serve
//!
//! # Environment Variables
//! - `JWT_SECRET` (**required**) – session token secret
//! - `DATABASE_URL` (**required** for postgres) – PostgreSQL connection string
//! - `AXUM_LOG_LEVEL` (optional) – log verbosity (default: `debug`)
//! - `AXUM_SPAN_EVENTS` (optional) – span event mode for tracing
//!
//! See [`lidarflow::config`] for the rest.
use std::{env, net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use dotenvy::dotenv;
use is_terminal::IsTerminal;
use sqlx::postgres::PgPoolOptions;
use tokio::net::TcpListener;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::format::FmtSpan;

use lidarflow::config::{self, StorageBackend};
use lidarflow::{device, reaper, routes, schema, AppState, Config, MeasurementStore};
use lidarflow::{MemoryStore, PgStore};

// ---

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    init_tracing();
    dotenv().ok();

    let cfg = config::load_from_env()?;
    cfg.log_config();

    let store = open_store(&cfg).await?;
    let state = AppState::new(store.clone(), cfg.clone());

    let device_addr = SocketAddr::from(([0, 0, 0, 0], cfg.device_port));
    let device_listener = TcpListener::bind(device_addr)
        .await
        .with_context(|| format!("Failed to bind device listener on {device_addr}"))?;
    let ingestor = state.ingestor.clone();
    let idle = cfg.session_idle;
    tokio::spawn(async move {
        if let Err(e) = device::serve(device_listener, ingestor, idle).await {
            tracing::error!("Device listener stopped: {}", e);
        }
    });

    reaper::spawn(
        store,
        state.ingestor.aggregator().clone(),
        cfg.session_idle,
        cfg.sweep_interval,
    );

    // Build app from routes gateway (EMBP)
    let app = routes::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

// ---

/// Open the configured backend and create the owners listed in `SEED_OWNERS`.
async fn open_store(cfg: &Config) -> Result<Arc<dyn MeasurementStore>> {
    // ---
    match cfg.storage {
        StorageBackend::Postgres => {
            tracing::info!("Attempting to connect to database");

            let pool = PgPoolOptions::new()
                .max_connections(cfg.db_pool_max)
                .connect(&cfg.db_url)
                .await
                .context("Failed to connect to database")?;

            tracing::info!("Successfully connected to database");

            schema::create_schema(&pool).await?;
            schema::seed_owners(&pool, &cfg.seed_owners).await?;
            Ok(Arc::new(PgStore::new(pool)))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory store; measurements are lost on restart");

            let store = MemoryStore::new();
            for entry in &cfg.seed_owners {
                let (login, display_name) = schema::split_owner_entry(entry);
                let id = store.add_owner(login, display_name).await;
                tracing::info!("Seeded owner {} as {}", login, id);
            }
            Ok(Arc::new(store))
        }
    }
}

/// Initialize the global tracing subscriber for structured logging.
///
/// - Log target, file, and line number output enabled
/// - Color output controlled by TTY detection and `FORCE_COLOR` env var:
///   - `FORCE_COLOR=1|true|yes`: force colors on
///   - `FORCE_COLOR=0|false|no`: force colors off
///   - unset or other values: auto-detect TTY
/// - Span event emission mode controlled by the `AXUM_SPAN_EVENTS` env var:
///   - `"full"`       : emit ENTER, EXIT, and CLOSE events with timing
///   - `"enter_exit"` : emit ENTER and EXIT only
///   - unset or other values: emit CLOSE events only (default)
/// - Log level from `RUST_LOG`, falling back to `AXUM_LOG_LEVEL`
///
/// Call once at startup before any tracing macro runs.
fn init_tracing() {
    // ---
    let span_events = match env::var("AXUM_SPAN_EVENTS").as_deref() {
        Ok("full") => FmtSpan::FULL,
        Ok("enter_exit") => FmtSpan::ENTER | FmtSpan::EXIT,
        _ => FmtSpan::CLOSE,
    };

    let use_color = match env::var("FORCE_COLOR").as_deref() {
        Ok("1") | Ok("true") | Ok("yes") => true,
        Ok("0") | Ok("false") | Ok("no") => false,
        _ => std::io::stdout().is_terminal(),
    };

    let env_filter = if env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match env::var("AXUM_LOG_LEVEL").ok().as_deref() {
            Some("trace") => "trace",
            Some("debug") => "debug",
            Some("info") => "info",
            Some("warn") => "warn",
            Some("error") => "error",
            _ => "debug",
        };
        EnvFilter::new(format!("{level},sqlx::query=warn"))
    };

    tracing_subscriber::fmt()
        .with_target(true)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(span_events)
        .with_env_filter(env_filter)
        .with_ansi(use_color)
        .compact()
        .init();
}
