// =============================================================================
// Runtime Configuration — dashboard settings loaded at startup
// =============================================================================
//
// Every tunable lives here: the tracked instruments, the feed subscription
// set, the quote-currency rate, tick periods, and reconnect behaviour.
//
// All fields carry `#[serde(default)]` so that a partial (or empty) JSON file
// still loads, and adding new fields never breaks an older config file.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::types::{CurrencyRate, Instrument, Timeframe};

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_instruments() -> Vec<Instrument> {
    vec![
        Instrument::new("BTCUSDT", "Bitcoin", "BTC", 19_640_000.0, Some(21_000_000.0)),
        Instrument::new("ETHUSDT", "Ethereum", "ETH", 120_000_000.0, None),
        Instrument::new("BNBUSDT", "Binance Coin", "BNB", 153_000_000.0, Some(200_000_000.0)),
        Instrument::new("SOLUSDT", "Solana", "SOL", 440_000_000.0, None),
        Instrument::new("XRPUSDT", "XRP", "XRP", 54_000_000_000.0, Some(100_000_000_000.0)),
        Instrument::new("DOGEUSDT", "Dogecoin", "DOGE", 143_000_000_000.0, None),
        Instrument::new("ADAUSDT", "Cardano", "ADA", 35_000_000_000.0, Some(45_000_000_000.0)),
        Instrument::new("TRXUSDT", "TRON", "TRX", 88_000_000_000.0, None),
        Instrument::new("AVAXUSDT", "Avalanche", "AVAX", 377_000_000.0, Some(720_000_000.0)),
        Instrument::new("SHIBUSDT", "Shiba Inu", "SHIB", 589_000_000_000_000.0, None),
    ]
}

fn default_stream_symbols() -> Vec<String> {
    vec![
        "BTCUSDT".to_string(),
        "ETHUSDT".to_string(),
        "BNBUSDT".to_string(),
        "SOLUSDT".to_string(),
        "XRPUSDT".to_string(),
    ]
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_quote_rate() -> f64 {
    84.0
}

fn default_quote_currency() -> String {
    "INR".to_string()
}

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_stream_base_url() -> String {
    "wss://stream.binance.com:9443".to_string()
}

fn default_live_tick_ms() -> u64 {
    2_000
}

fn default_coarse_tick_ms() -> u64 {
    60_000
}

fn default_slow_tick_secs() -> u64 {
    10
}

fn default_page_size() -> usize {
    10
}

fn default_page_count() -> usize {
    10
}

fn default_reconnect_initial_ms() -> u64 {
    500
}

fn default_reconnect_max_ms() -> u64 {
    30_000
}

fn default_ping_interval_secs() -> u64 {
    20
}

fn default_stale_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    10
}

// =============================================================================
// FeedParams
// =============================================================================

/// Push-feed connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedParams {
    /// Base URL of the combined-stream endpoint (no path).
    #[serde(default = "default_stream_base_url")]
    pub stream_base_url: String,

    /// First reconnect delay; doubles on each consecutive failure.
    #[serde(default = "default_reconnect_initial_ms")]
    pub reconnect_initial_ms: u64,

    /// Upper bound for the reconnect delay.
    #[serde(default = "default_reconnect_max_ms")]
    pub reconnect_max_ms: u64,

    /// Keepalive ping period.
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,

    /// A connection with no inbound frame for this long is considered dead.
    #[serde(default = "default_stale_timeout_secs")]
    pub stale_timeout_secs: u64,
}

impl Default for FeedParams {
    fn default() -> Self {
        Self {
            stream_base_url: default_stream_base_url(),
            reconnect_initial_ms: default_reconnect_initial_ms(),
            reconnect_max_ms: default_reconnect_max_ms(),
            ping_interval_secs: default_ping_interval_secs(),
            stale_timeout_secs: default_stale_timeout_secs(),
        }
    }
}

// =============================================================================
// RefreshParams
// =============================================================================

/// Tick periods for the two refresh timers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshParams {
    /// FAST period while the LIVE timeframe is selected.
    #[serde(default = "default_live_tick_ms")]
    pub live_tick_ms: u64,

    /// FAST period for every coarser timeframe.
    #[serde(default = "default_coarse_tick_ms")]
    pub coarse_tick_ms: u64,

    /// SLOW period (aggregate tickers, market table, cache fill).
    #[serde(default = "default_slow_tick_secs")]
    pub slow_tick_secs: u64,
}

impl Default for RefreshParams {
    fn default() -> Self {
        Self {
            live_tick_ms: default_live_tick_ms(),
            coarse_tick_ms: default_coarse_tick_ms(),
            slow_tick_secs: default_slow_tick_secs(),
        }
    }
}

impl RefreshParams {
    /// FAST tick period for the given timeframe.
    ///
    /// LIVE is clamped to stay strictly below the coarse period even when a
    /// config file sets them equal.
    pub fn fast_period(&self, timeframe: Timeframe) -> Duration {
        let coarse = self.coarse_tick_ms.max(2);
        if timeframe.is_live() {
            Duration::from_millis(self.live_tick_ms.clamp(1, coarse - 1))
        } else {
            Duration::from_millis(coarse)
        }
    }

    pub fn slow_period(&self) -> Duration {
        Duration::from_secs(self.slow_tick_secs.max(1))
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level configuration for the dashboard backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Instruments shown in pickers and pre-seeded in the price table.
    #[serde(default = "default_instruments")]
    pub instruments: Vec<Instrument>,

    /// Subset of instruments subscribed on the push feed.
    #[serde(default = "default_stream_symbols")]
    pub stream_symbols: Vec<String>,

    /// Instrument selected at startup.
    #[serde(default = "default_symbol")]
    pub default_symbol: String,

    /// USD → quote currency multiplier applied at ingestion.
    #[serde(default = "default_quote_rate")]
    pub quote_rate: f64,

    /// Quote currency code (informational, passed to the front end).
    #[serde(default = "default_quote_currency")]
    pub quote_currency: String,

    /// REST API base URL.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Transport timeout for REST calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Rows per market-table page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Number of market-table pages.
    #[serde(default = "default_page_count")]
    pub page_count: usize,

    #[serde(default)]
    pub feed: FeedParams,

    #[serde(default)]
    pub refresh: RefreshParams,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            instruments: default_instruments(),
            stream_symbols: default_stream_symbols(),
            default_symbol: default_symbol(),
            quote_rate: default_quote_rate(),
            quote_currency: default_quote_currency(),
            rest_base_url: default_rest_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            page_size: default_page_size(),
            page_count: default_page_count(),
            feed: FeedParams::default(),
            refresh: RefreshParams::default(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read dashboard config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse dashboard config from {}", path.display()))?;

        info!(
            path = %path.display(),
            instruments = config.instruments.len(),
            stream_symbols = ?config.stream_symbols,
            "dashboard config loaded"
        );

        Ok(config)
    }

    pub fn currency_rate(&self) -> CurrencyRate {
        CurrencyRate(self.quote_rate)
    }

    /// Look up a tracked instrument by symbol.
    pub fn instrument(&self, symbol: &str) -> Option<&Instrument> {
        self.instruments.iter().find(|i| i.symbol == symbol)
    }

    /// Drop stream symbols that are not tracked instruments and make sure the
    /// default symbol points at a tracked one.
    pub fn normalize(&mut self) {
        let tracked: Vec<String> = self.instruments.iter().map(|i| i.symbol.clone()).collect();
        self.stream_symbols.retain(|s| tracked.contains(s));
        if !tracked.contains(&self.default_symbol) {
            if let Some(first) = tracked.first() {
                self.default_symbol = first.clone();
            }
        }
        self.page_size = self.page_size.max(1);
        self.page_count = self.page_count.max(1);
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.instruments.len(), 10);
        assert_eq!(cfg.instruments[0].symbol, "BTCUSDT");
        assert_eq!(cfg.instruments[0].max_supply, Some(21_000_000.0));
        assert_eq!(cfg.stream_symbols.len(), 5);
        assert_eq!(cfg.default_symbol, "BTCUSDT");
        assert!((cfg.quote_rate - 84.0).abs() < f64::EPSILON);
        assert_eq!(cfg.page_size, 10);
        assert_eq!(cfg.page_count, 10);
        assert_eq!(cfg.refresh.slow_tick_secs, 10);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.instruments.len(), 10);
        assert_eq!(cfg.feed.reconnect_initial_ms, 500);
        assert_eq!(cfg.refresh.live_tick_ms, 2_000);
        assert_eq!(cfg.refresh.coarse_tick_ms, 60_000);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "quote_rate": 1.0, "refresh": { "slow_tick_secs": 30 } }"#;
        let cfg: RuntimeConfig = serde_json::from_str(json).unwrap();
        assert!((cfg.quote_rate - 1.0).abs() < f64::EPSILON);
        assert_eq!(cfg.refresh.slow_tick_secs, 30);
        assert_eq!(cfg.refresh.live_tick_ms, 2_000);
        assert_eq!(cfg.stream_symbols[0], "BTCUSDT");
    }

    #[test]
    fn live_fast_period_is_shorter_than_coarse() {
        let refresh = RefreshParams::default();
        let live = refresh.fast_period(Timeframe::Live);
        assert!(live < refresh.fast_period(Timeframe::Year));
        assert!(live < refresh.fast_period(Timeframe::FiveYears));
    }

    #[test]
    fn live_fast_period_clamped_below_coarse() {
        let refresh = RefreshParams {
            live_tick_ms: 5_000,
            coarse_tick_ms: 5_000,
            slow_tick_secs: 10,
        };
        assert!(refresh.fast_period(Timeframe::Live) < refresh.fast_period(Timeframe::Week));
    }

    #[test]
    fn normalize_drops_untracked_stream_symbols() {
        let mut cfg = RuntimeConfig {
            stream_symbols: vec!["BTCUSDT".into(), "PEPEUSDT".into()],
            default_symbol: "PEPEUSDT".into(),
            ..RuntimeConfig::default()
        };
        cfg.normalize();
        assert_eq!(cfg.stream_symbols, vec!["BTCUSDT"]);
        assert_eq!(cfg.default_symbol, "BTCUSDT");
    }
}
