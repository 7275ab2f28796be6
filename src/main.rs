// =============================================================================
// Aurora Dashboard — Main Entry Point
// =============================================================================
//
// Wires the market-data backend together: the trade-stream ingester feeding
// the latest price table, the REST client behind the series caches and the
// ticker snapshot, the dashboard actor with its refresh scheduler, and the
// HTTP / WebSocket API the front end talks to.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod api;
mod app_state;
mod binance;
mod control;
mod dashboard;
mod indicators;
mod market_data;
mod runtime_config;
mod scheduler;
mod types;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::binance::BinanceClient;
use crate::dashboard::Dashboard;
use crate::market_data::{IngesterSettings, LatestPriceTable, StreamIngester};
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::{RefreshScheduler, TICK_BUFFER};

const DEFAULT_CONFIG_PATH: &str = "dashboard_config.json";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:3001";

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
    info!("║        Aurora Dashboard — Starting Up                    ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config_path =
        std::env::var("DASHBOARD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.into());
    let mut config = RuntimeConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // Override the streamed symbols from env if available.
    if let Ok(syms) = std::env::var("DASHBOARD_SYMBOLS") {
        config.stream_symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Ok(rate) = std::env::var("DASHBOARD_USD_RATE") {
        match rate.trim().parse::<f64>() {
            Ok(r) if r.is_finite() && r > 0.0 => config.quote_rate = r,
            _ => warn!(value = %rate, "Ignoring invalid DASHBOARD_USD_RATE"),
        }
    }
    config.normalize();

    info!(
        instruments = config.instruments.len(),
        stream_symbols = ?config.stream_symbols,
        quote_currency = %config.quote_currency,
        quote_rate = config.quote_rate,
        "Configured dashboard"
    );

    let config = Arc::new(config);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── 2. Latest price table + trade stream ─────────────────────────────
    let prices = Arc::new(LatestPriceTable::new(
        config.instruments.iter().map(|i| i.symbol.clone()),
        0.0,
    ));

    let ingester = StreamIngester::new(
        IngesterSettings::from_feed(
            &config.feed,
            config.stream_symbols.clone(),
            config.currency_rate(),
        ),
        prices.clone(),
    );
    let feed = ingester.status();
    let ingester_task = ingester.spawn(shutdown_rx.clone());

    // ── 3. REST client ───────────────────────────────────────────────────
    let client = BinanceClient::new(
        config.rest_base_url.clone(),
        Duration::from_secs(config.request_timeout_secs),
        config.currency_rate(),
    )
    .context("failed to build REST client")?;
    let rate_limits = client.rate_limits();

    // ── 4. Dashboard actor + refresh scheduler ───────────────────────────
    let (ticks_tx, ticks_rx) = mpsc::channel(TICK_BUFFER);
    let (dashboard, handle, timeframe_rx) = Dashboard::new(
        config.clone(),
        prices.clone(),
        feed.clone(),
        client.clone(),
        client,
        ticks_rx,
    );
    let dashboard_task = dashboard.spawn(shutdown_rx.clone());
    let scheduler_task =
        RefreshScheduler::new(config.refresh.clone(), timeframe_rx, ticks_tx).spawn(shutdown_rx.clone());

    // ── 5. API server ────────────────────────────────────────────────────
    let api_state = Arc::new(AppState::new(handle, prices, feed, rate_limits));
    let bind_addr =
        std::env::var("DASHBOARD_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.into());
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind API server on {bind_addr}"))?;
    info!(addr = %bind_addr, "API server listening");

    let mut server_shutdown = shutdown_rx.clone();
    let server_task = tokio::spawn(async move {
        let app = api::rest::router(api_state);
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.wait_for(|stop| *stop).await;
            })
            .await;
        if let Err(e) = result {
            error!(error = %e, "API server failed");
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");
    let _ = shutdown_tx.send(true);

    for (name, task) in [
        ("scheduler", scheduler_task),
        ("dashboard", dashboard_task),
        ("ingester", ingester_task),
        ("api", server_task),
    ] {
        if let Err(e) = task.await {
            error!(task = name, error = %e, "task ended abnormally");
        }
    }

    info!("Aurora Dashboard shut down complete.");
    Ok(())
}
