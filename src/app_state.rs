// =============================================================================
// Central Application State — shared by the API handlers
// =============================================================================
//
// Ties together the handles the presentation boundary needs: the dashboard
// handle (view + control channel), the latest price table, the feed status
// and the REST weight tracker. Everything here is either immutable or
// internally synchronised, so handlers share it through `Arc<AppState>`.
// =============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;

use crate::binance::rate_limit::{RateLimitSnapshot, RateLimitTracker};
use crate::dashboard::DashboardHandle;
use crate::market_data::price_table::LatestPriceTable;
use crate::market_data::trade_stream::{FeedStatus, FeedStatusSnapshot};

pub struct AppState {
    pub dashboard: DashboardHandle,
    pub prices: Arc<LatestPriceTable>,
    pub feed: Arc<FeedStatus>,
    pub rate_limits: Arc<RateLimitTracker>,

    /// Open WebSocket connections.
    pub ws_clients: AtomicU64,
    /// WebSocket messages sent since startup, across all connections.
    pub ws_sequence_number: AtomicU64,

    /// Used for uptime calculations.
    pub start_time: Instant,
}

/// Operational summary served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub server_time: i64,
    pub view_version: u64,
    pub price_updates: u64,
    pub feed: FeedStatusSnapshot,
    pub rate_limit: RateLimitSnapshot,
    pub ws_clients: u64,
}

impl AppState {
    pub fn new(
        dashboard: DashboardHandle,
        prices: Arc<LatestPriceTable>,
        feed: Arc<FeedStatus>,
        rate_limits: Arc<RateLimitTracker>,
    ) -> Self {
        Self {
            dashboard,
            prices,
            feed,
            rate_limits,
            ws_clients: AtomicU64::new(0),
            ws_sequence_number: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn health(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: "ok",
            uptime_secs: self.start_time.elapsed().as_secs(),
            server_time: chrono::Utc::now().timestamp_millis(),
            view_version: self.dashboard.view().version,
            price_updates: self.prices.update_count(),
            feed: self.feed.snapshot(),
            rate_limit: self.rate_limits.snapshot(),
            ws_clients: self.ws_clients.load(Ordering::Relaxed),
        }
    }

    /// Next global WebSocket sequence number.
    pub fn next_sequence(&self) -> u64 {
        self.ws_sequence_number.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("prices", &self.prices)
            .field("ws_clients", &self.ws_clients.load(Ordering::Relaxed))
            .finish()
    }
}
