//! kiln-server – entry point.
//!
//! Startup order:
//! 1. Parse server configuration and conversion limits from the environment.
//! 2. Initialise structured tracing (JSON in production, pretty in dev).
//! 3. Report clamped limits as alerts.
//! 4. Open the durable cache (SQLite), falling back to memory only.
//! 5. Start the scheduler, the health background tasks and the HTTP server
//!    with graceful shutdown.

mod client;
mod config;
mod db;
mod error;
mod middleware;
mod routes;
mod schemas;
mod state;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use kiln_core::health::TracingAlertSink;
use kiln_core::{Alert, ConversionCache, HealthMonitor, ServiceConfig};
use tracing::{info, warn};

use crate::config::Config;
use crate::db::sqlite::SqliteCacheStore;
use crate::state::AppState;

const LAG_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const SCORE_REFRESH_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Configuration ───────────────────────────────────────────────────────
    let cfg = Config::from_env();
    let loaded = ServiceConfig::from_env();

    // ── 2. Tracing ─────────────────────────────────────────────────────────────
    let env_filter = match tracing_subscriber::EnvFilter::try_from_default_env() {
        Ok(f) => f,
        Err(_) => match cfg.log_level.parse::<tracing_subscriber::EnvFilter>() {
            Ok(f) => f,
            Err(e) => {
                eprintln!(
                    "WARN: KILN_LOG='{}' is not a valid tracing filter ({}); \
                     falling back to 'info'",
                    cfg.log_level, e
                );
                tracing_subscriber::EnvFilter::new("info")
            }
        },
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_thread_ids(true);

    if cfg.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!(version = env!("CARGO_PKG_VERSION"), "kiln-server starting");

    // ── 3. Limits ──────────────────────────────────────────────────────────────
    let service = loaded.config;
    let health = Arc::new(HealthMonitor::new(&service, Arc::new(TracingAlertSink)));
    for adj in loaded.adjustments {
        health.alert(Alert::ConfigClamped {
            key: adj.key,
            requested: adj.requested,
            applied: adj.applied,
            reason: adj.reason,
        });
    }
    info!(
        global_concurrency = service.global_concurrency,
        client_concurrency = service.client_concurrency,
        max_upload_bytes = service.max_upload_bytes,
        "conversion limits loaded"
    );

    // ── 4. Cache ───────────────────────────────────────────────────────────────
    let cache = open_cache(&cfg.cache_database_url).await;

    // ── 5. Scheduler + HTTP server ─────────────────────────────────────────────
    let state = AppState::new(cfg.clone(), service, cache, Arc::clone(&health));
    let lag_probe = health.spawn_lag_probe(LAG_PROBE_INTERVAL);
    let score_refresh = health.spawn_score_refresh(SCORE_REFRESH_INTERVAL);

    let app = routes::build(Arc::clone(&state));
    let addr: SocketAddr = cfg.bind_address.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "HTTP server listening");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    lag_probe.abort();
    score_refresh.abort();
    info!("kiln-server stopped");
    Ok(())
}

/// Durable SQLite cache when configured and reachable, memory otherwise.
async fn open_cache(url: &str) -> ConversionCache {
    if url.trim().is_empty() {
        info!("durable cache disabled; caching in memory only");
        return ConversionCache::memory_only();
    }
    match SqliteCacheStore::connect(url).await {
        Ok(store) => {
            info!(database_url = %url, "durable cache ready");
            ConversionCache::with_durable(Arc::new(store))
        }
        Err(e) => {
            warn!(database_url = %url, error = %e, "durable cache unavailable; caching in memory only");
            ConversionCache::memory_only()
        }
    }
}

/// Returns a future that resolves when SIGINT (Ctrl-C) or SIGTERM is received.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to install CTRL+C signal handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => warn!(error = %e, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received; starting graceful shutdown");
}
