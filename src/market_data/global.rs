// =============================================================================
// Global Market Overview — whole-market totals estimated from BTC dailies
// =============================================================================
//
// There is no free total-market endpoint, so the overview is scaled up from a
// year of BTC daily candles:
//
//   market cap    close × circulating supply × (1 / BTC dominance)
//   volume        base volume × VOLUME_SCALE
//
// History points count back from the newest candle (1d = second to last,
// 7d = eighth to last, 30d = thirty-first to last); the 1y point is the
// oldest candle in the window.
// =============================================================================

use serde::Serialize;

use crate::market_data::candle::CandleSeries;
use crate::types::SeriesKey;

pub const GLOBAL_SYMBOL: &str = "BTCUSDT";
pub const GLOBAL_INTERVAL: &str = "1d";
pub const GLOBAL_LIMIT: u32 = 365;

const BTC_SUPPLY: f64 = 19_600_000.0;
/// BTC taken as half of the total market.
const DOMINANCE_FACTOR: f64 = 2.0;
const VOLUME_SCALE: f64 = 50_000.0;

pub fn global_key() -> SeriesKey {
    SeriesKey::new(GLOBAL_SYMBOL, GLOBAL_INTERVAL, GLOBAL_LIMIT)
}

/// Estimated total cap at fixed look-back points.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CapHistory {
    pub day_ago: Option<f64>,
    pub week_ago: Option<f64>,
    pub month_ago: Option<f64>,
    pub year_ago: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalMarket {
    pub market_cap: f64,
    /// `None` when the previous day's cap is missing or zero.
    pub change_24h_pct: Option<f64>,
    pub history: CapHistory,
    pub year_high: f64,
    pub year_low: f64,
    pub open_times: Vec<i64>,
    pub market_caps: Vec<f64>,
    pub volumes: Vec<f64>,
}

impl GlobalMarket {
    pub fn compute(series: &CandleSeries) -> Option<Self> {
        let candles = series.candles();
        if candles.is_empty() {
            return None;
        }
        let market_caps: Vec<f64> = candles
            .iter()
            .map(|c| c.close * BTC_SUPPLY * DOMINANCE_FACTOR)
            .collect();
        let volumes = candles.iter().map(|c| c.volume * VOLUME_SCALE).collect();
        let open_times = candles.iter().map(|c| c.open_time).collect();

        let back = |days: usize| -> Option<f64> {
            market_caps.len().checked_sub(days + 1).map(|i| market_caps[i])
        };
        let market_cap = *market_caps.last()?;
        let day_ago = back(1);
        let change_24h_pct = day_ago
            .filter(|prev| *prev > 0.0)
            .map(|prev| (market_cap - prev) / prev * 100.0);
        let history = CapHistory {
            day_ago,
            week_ago: back(7),
            month_ago: back(30),
            year_ago: market_caps.first().copied(),
        };

        let year_high = market_caps.iter().copied().fold(f64::MIN, f64::max);
        let year_low = market_caps.iter().copied().fold(f64::MAX, f64::min);

        Some(Self {
            market_cap,
            change_24h_pct,
            history,
            year_high,
            year_low,
            open_times,
            market_caps,
            volumes,
        })
    }
}
