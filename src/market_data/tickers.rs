// =============================================================================
// Aggregate Tickers — 24h statistics snapshot and the derived market table
// =============================================================================
//
// Refreshed on the SLOW tick only. Everything derived here (market table,
// gainers / losers, performance bars) is rebuilt from one snapshot, so the
// pieces are consistent with each other even though they lag the live feed.
// =============================================================================

use std::cmp::Ordering;
use std::collections::HashMap;
use std::future::Future;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Instrument;

/// Quote asset the market table is restricted to.
pub const QUOTE_ASSET: &str = "USDT";

/// 24h statistics for one symbol, converted into the quote currency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerStat {
    pub symbol: String,
    pub last_price: f64,
    /// 24h change in percent (e.g. 2.5 = +2.5 %).
    pub change_pct: f64,
    pub quote_volume: f64,
}

/// Upstream provider of aggregate 24h tickers.
pub trait TickerSource: Send + Sync + 'static {
    fn fetch_tickers(&self) -> impl Future<Output = Result<Vec<TickerStat>>> + Send;
}

/// One complete aggregate-ticker fetch.
#[derive(Debug, Clone, Serialize)]
pub struct TickerSnapshot {
    stats: HashMap<String, TickerStat>,
    pub fetched_at: DateTime<Utc>,
}

impl TickerSnapshot {
    pub fn new(stats: Vec<TickerStat>, fetched_at: DateTime<Utc>) -> Self {
        let stats = stats.into_iter().map(|s| (s.symbol.clone(), s)).collect();
        Self { stats, fetched_at }
    }

    pub fn get(&self, symbol: &str) -> Option<&TickerStat> {
        self.stats.get(symbol)
    }

    pub fn len(&self) -> usize {
        self.stats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TickerStat> {
        self.stats.values()
    }
}

// ---------------------------------------------------------------------------
// Market table
// ---------------------------------------------------------------------------

/// One row of the ranked market table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRow {
    pub rank: usize,
    pub symbol: String,
    pub name: String,
    pub price: f64,
    /// `price × circulating supply`; only known for tracked instruments.
    pub market_cap: Option<f64>,
    pub volume: f64,
    pub change_24h: f64,
}

fn base_asset(symbol: &str) -> &str {
    symbol.strip_suffix(QUOTE_ASSET).unwrap_or(symbol)
}

/// Rank `QUOTE_ASSET` pairs by quote volume (descending) and keep the top
/// `limit`.
pub fn build_market_table(
    snapshot: &TickerSnapshot,
    instruments: &[Instrument],
    limit: usize,
) -> Vec<MarketRow> {
    let supplies: HashMap<&str, f64> = instruments
        .iter()
        .map(|i| (i.symbol.as_str(), i.circulating_supply))
        .collect();

    let mut stats: Vec<&TickerStat> = snapshot
        .iter()
        .filter(|s| s.symbol.ends_with(QUOTE_ASSET) && s.symbol.len() > QUOTE_ASSET.len())
        .collect();
    stats.sort_by(|a, b| {
        b.quote_volume
            .partial_cmp(&a.quote_volume)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.symbol.cmp(&b.symbol))
    });

    stats
        .into_iter()
        .take(limit)
        .enumerate()
        .map(|(i, s)| {
            let supply = supplies.get(s.symbol.as_str()).copied().unwrap_or(0.0);
            MarketRow {
                rank: i + 1,
                symbol: s.symbol.clone(),
                name: base_asset(&s.symbol).to_string(),
                price: s.last_price,
                market_cap: (supply > 0.0).then(|| s.last_price * supply),
                volume: s.quote_volume,
                change_24h: s.change_pct,
            }
        })
        .collect()
}

/// Rows of page `page` (1-based). Out-of-range pages are empty.
pub fn page_rows(rows: &[MarketRow], page: usize, page_size: usize) -> &[MarketRow] {
    if page == 0 || page_size == 0 {
        return &[];
    }
    let start = (page - 1).saturating_mul(page_size);
    if start >= rows.len() {
        return &[];
    }
    let end = (start + page_size).min(rows.len());
    &rows[start..end]
}

/// Top gainers and losers by 24h change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Movers {
    pub gainers: Vec<MarketRow>,
    pub losers: Vec<MarketRow>,
}

pub fn top_movers(rows: &[MarketRow], n: usize) -> Movers {
    let mut sorted: Vec<MarketRow> = rows.to_vec();
    sorted.sort_by(|a, b| {
        b.change_24h
            .partial_cmp(&a.change_24h)
            .unwrap_or(Ordering::Equal)
    });
    let gainers = sorted.iter().take(n).cloned().collect();
    let losers = sorted.iter().rev().take(n).cloned().collect();
    Movers { gainers, losers }
}

/// 24h change of one tracked instrument, for the performance bar chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBar {
    pub symbol: String,
    pub name: String,
    pub change_pct: f64,
}

/// Tracked instruments present in the snapshot, best performer first.
pub fn performance_bars(snapshot: &TickerSnapshot, instruments: &[Instrument]) -> Vec<PerformanceBar> {
    let mut bars: Vec<PerformanceBar> = instruments
        .iter()
        .filter_map(|i| {
            snapshot.get(&i.symbol).map(|s| PerformanceBar {
                symbol: i.symbol.clone(),
                name: i.name.clone(),
                change_pct: s.change_pct,
            })
        })
        .collect();
    bars.sort_by(|a, b| {
        b.change_pct
            .partial_cmp(&a.change_pct)
            .unwrap_or(Ordering::Equal)
    });
    bars
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn stat(symbol: &str, price: f64, change: f64, volume: f64) -> TickerStat {
        TickerStat {
            symbol: symbol.to_string(),
            last_price: price,
            change_pct: change,
            quote_volume: volume,
        }
    }

    fn instruments() -> Vec<Instrument> {
        vec![
            Instrument::new("BTCUSDT", "Bitcoin", "BTC", 10.0, Some(21.0)),
            Instrument::new("ETHUSDT", "Ethereum", "ETH", 100.0, None),
        ]
    }

    fn snapshot() -> TickerSnapshot {
        TickerSnapshot::new(
            vec![
                stat("BTCUSDT", 100.0, 2.0, 9_000.0),
                stat("ETHUSDT", 10.0, -3.0, 8_000.0),
                stat("PEPEUSDT", 0.1, 12.0, 7_000.0),
                stat("ETHBTC", 0.05, 1.0, 99_999.0),
                stat("USDT", 1.0, 0.0, 1.0),
            ],
            Utc::now(),
        )
    }

    #[test]
    fn market_table_ranks_usdt_pairs_by_volume() {
        let rows = build_market_table(&snapshot(), &instruments(), 100);
        let symbols: Vec<&str> = rows.iter().map(|r| r.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "PEPEUSDT"]);
        assert_eq!(rows[0].rank, 1);
        assert_eq!(rows[2].name, "PEPE");
    }

    #[test]
    fn market_cap_only_for_known_supply() {
        let rows = build_market_table(&snapshot(), &instruments(), 100);
        assert_eq!(rows[0].market_cap, Some(1_000.0));
        assert_eq!(rows[2].market_cap, None);
    }

    #[test]
    fn market_table_respects_limit() {
        let rows = build_market_table(&snapshot(), &instruments(), 2);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn page_rows_slices_and_clamps() {
        let rows = build_market_table(&snapshot(), &instruments(), 100);
        assert_eq!(page_rows(&rows, 1, 2).len(), 2);
        assert_eq!(page_rows(&rows, 2, 2).len(), 1);
        assert!(page_rows(&rows, 3, 2).is_empty());
        assert!(page_rows(&rows, 0, 2).is_empty());
    }

    #[test]
    fn movers_split_gainers_and_losers() {
        let rows = build_market_table(&snapshot(), &instruments(), 100);
        let movers = top_movers(&rows, 1);
        assert_eq!(movers.gainers[0].symbol, "PEPEUSDT");
        assert_eq!(movers.losers[0].symbol, "ETHUSDT");
    }

    #[test]
    fn performance_bars_sorted_desc() {
        let bars = performance_bars(&snapshot(), &instruments());
        assert_eq!(bars.len(), 2);
        assert_eq!(bars[0].symbol, "BTCUSDT");
        assert_eq!(bars[1].change_pct, -3.0);
    }
}
