// =============================================================================
// Shared types used across the Aurora dashboard backend
// =============================================================================

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A tracked instrument. Immutable once loaded from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instrument {
    /// Exchange symbol, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Display name, e.g. `Bitcoin`.
    pub name: String,
    /// Base asset ticker, e.g. `BTC`.
    pub base: String,
    /// Circulating supply in base units.
    #[serde(default)]
    pub circulating_supply: f64,
    /// Hard-capped supply, `None` when uncapped.
    #[serde(default)]
    pub max_supply: Option<f64>,
}

impl Instrument {
    pub fn new(
        symbol: impl Into<String>,
        name: impl Into<String>,
        base: impl Into<String>,
        circulating_supply: f64,
        max_supply: Option<f64>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            name: name.into(),
            base: base.into(),
            circulating_supply,
            max_supply,
        }
    }
}

// =============================================================================
// Timeframe
// =============================================================================

/// The fixed set of chart timeframes a user can pick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "LIVE")]
    Live,
    #[serde(rename = "24H")]
    Day,
    #[serde(rename = "7D")]
    Week,
    #[serde(rename = "1M")]
    Month,
    #[serde(rename = "1Y")]
    Year,
    #[serde(rename = "5Y")]
    FiveYears,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::Live,
        Timeframe::Day,
        Timeframe::Week,
        Timeframe::Month,
        Timeframe::Year,
        Timeframe::FiveYears,
    ];

    /// Candle granularity code understood by the klines endpoint.
    pub fn granularity(self) -> &'static str {
        match self {
            Self::Live => "1m",
            Self::Day => "15m",
            Self::Week => "1h",
            Self::Month => "4h",
            Self::Year => "1d",
            Self::FiveYears => "1w",
        }
    }

    /// Number of candles requested for the chart.
    pub fn count(self) -> u32 {
        match self {
            Self::Live => 50,
            Self::Day => 96,
            Self::Week => 168,
            Self::Month => 180,
            Self::Year => 365,
            Self::FiveYears => 260,
        }
    }

    pub fn is_live(self) -> bool {
        self == Self::Live
    }

    /// How old a cached series may get before the slow tick refreshes it.
    ///
    /// `None` for LIVE: that series is fetched once per key and only its last
    /// candle is patched from the price table afterwards.
    pub fn refetch_after(self) -> Option<Duration> {
        const MINUTE: u64 = 60;
        match self {
            Self::Live => None,
            Self::Day => Some(Duration::from_secs(15 * MINUTE)),
            Self::Week => Some(Duration::from_secs(60 * MINUTE)),
            Self::Month => Some(Duration::from_secs(4 * 60 * MINUTE)),
            Self::Year => Some(Duration::from_secs(24 * 60 * MINUTE)),
            Self::FiveYears => Some(Duration::from_secs(7 * 24 * 60 * MINUTE)),
        }
    }

    /// Button label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Day => "24H",
            Self::Week => "7D",
            Self::Month => "1M",
            Self::Year => "1Y",
            Self::FiveYears => "5Y",
        }
    }
}

impl Default for Timeframe {
    fn default() -> Self {
        Self::Live
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// =============================================================================
// Cache key
// =============================================================================

/// Identifies one historical series: (instrument, granularity, count).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: String,
    pub limit: u32,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, interval: impl Into<String>, limit: u32) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            limit,
        }
    }

    pub fn for_timeframe(symbol: impl Into<String>, timeframe: Timeframe) -> Self {
        Self::new(symbol, timeframe.granularity(), timeframe.count())
    }
}

impl std::fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}x{}", self.symbol, self.interval, self.limit)
    }
}

// =============================================================================
// Currency conversion
// =============================================================================

/// Fixed multiplicative quote-currency conversion, applied once when data
/// enters the process (stream ingestion or REST fetch).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurrencyRate(pub f64);

impl CurrencyRate {
    pub const IDENTITY: CurrencyRate = CurrencyRate(1.0);

    pub fn apply(self, usd: f64) -> f64 {
        usd * self.0
    }
}

impl Default for CurrencyRate {
    fn default() -> Self {
        Self::IDENTITY
    }
}
