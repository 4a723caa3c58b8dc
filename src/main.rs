// =============================================================================
// OKX Market Gateway — Main Entry Point
// =============================================================================
//
// Read-only market data (ticker, order book, klines, instruments) from the
// OKX v5 public API, behind a candle cache and two rate-limit namespaces.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod error;
mod market_data;
mod okx;
mod rate_limit;
mod runtime_config;
mod service;
mod types;

#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::runtime_config::{ServiceConfig, CONFIG_PATH_ENV, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        OKX Market Gateway — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = ServiceConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        ServiceConfig::default()
    });
    config.apply_env_overrides();
    config.validate().context("invalid service config")?;

    info!(
        okx_base_url = %config.okx_base_url,
        timeout_ms = config.request_timeout_ms,
        max_retries = config.max_retries,
        upstream_limit = config.upstream_rate_limit.limit,
        upstream_window_secs = config.upstream_rate_limit.window_secs,
        consumer_limit = config.consumer_rate_limit.limit,
        consumer_window_secs = config.consumer_rate_limit.window_secs,
        trust_consumer_header = config.trust_consumer_header,
        admin_enabled = config.admin_token.is_some(),
        "Gateway configuration"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let bind_addr = config.bind_addr.clone();
    let state = Arc::new(AppState::build(config)?);

    // ── 3. Start the API server ──────────────────────────────────────────
    let app = api::rest::router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening. Press Ctrl+C to stop.");

    // Peer addresses feed the consumer identity fallback.
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("API server failed")?;

    info!("OKX Market Gateway shut down complete.");
    Ok(())
}

// ── 4. Graceful shutdown ─────────────────────────────────────────────────────
async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl+C; graceful shutdown disabled");
        std::future::pending::<()>().await;
    }
    warn!("Shutdown signal received — draining in-flight requests");
}
