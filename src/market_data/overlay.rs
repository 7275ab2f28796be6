// =============================================================================
// Series Merge View — live price overlaid onto a cached candle series
// =============================================================================
//
// Pure functions only. The cached series is never touched: `overlay` returns a
// patched copy whose prefix is identical to the input and whose final close is
// the live price. Key metrics mix that fast price with the slow 24h ticker
// snapshot; the two are read independently and may disagree for up to one
// slow tick.
// =============================================================================

use serde::Serialize;

use super::candle::CandleSeries;
use super::price_table::PriceQuote;
use super::tickers::TickerStat;
use crate::types::{Instrument, Timeframe};

/// Copy `series` and patch its final candle with `live_price`.
///
/// Every candle but the last is left untouched. On LIVE the last candle's
/// high/low envelope is widened to contain the new close; coarser timeframes
/// only get the close replaced. An empty series yields an empty series.
pub fn overlay(series: &CandleSeries, live_price: f64, timeframe: Timeframe) -> CandleSeries {
    let mut display = series.clone();
    if let Some(last) = display.last_mut() {
        last.close = live_price;
        if timeframe.is_live() {
            last.high = last.high.max(live_price);
            last.low = last.low.min(live_price);
        }
    }
    display
}

/// Where the displayed price came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceSource {
    Stream,
    Ticker,
    Candle,
}

/// Pick the price to display: a live stream quote, else the 24h ticker's
/// last price, else the cached series' final close.
pub fn resolve_price(
    quote: Option<PriceQuote>,
    ticker: Option<&TickerStat>,
    series: Option<&CandleSeries>,
) -> Option<(f64, PriceSource)> {
    if let Some(q) = quote.filter(|q| q.is_live()) {
        return Some((q.price, PriceSource::Stream));
    }
    if let Some(t) = ticker {
        return Some((t.last_price, PriceSource::Ticker));
    }
    series
        .and_then(|s| s.last())
        .map(|c| (c.close, PriceSource::Candle))
}

/// Headline numbers shown next to the chart.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyMetrics {
    pub price: f64,
    pub price_source: PriceSource,
    /// 24h change in percent; 0 until the first ticker snapshot lands.
    pub change_pct: f64,
    pub volume_24h: f64,
    pub market_cap: Option<f64>,
    /// Fully diluted valuation; equals market cap for uncapped supply.
    pub fdv: Option<f64>,
    /// 24h volume as a percentage of market cap.
    pub volume_to_market_cap_pct: Option<f64>,
    pub circulating_supply: f64,
    pub max_supply: Option<f64>,
}

impl KeyMetrics {
    pub fn compute(
        instrument: &Instrument,
        price: f64,
        price_source: PriceSource,
        ticker: Option<&TickerStat>,
    ) -> Self {
        let change_pct = ticker.map(|t| t.change_pct).unwrap_or(0.0);
        let volume_24h = ticker.map(|t| t.quote_volume).unwrap_or(0.0);

        let market_cap =
            (instrument.circulating_supply > 0.0).then(|| price * instrument.circulating_supply);
        let fdv = match instrument.max_supply {
            Some(max) if max > 0.0 => Some(price * max),
            _ => market_cap,
        };
        let volume_to_market_cap_pct = market_cap
            .filter(|cap| *cap > 0.0)
            .map(|cap| volume_24h / cap * 100.0);

        Self {
            price,
            price_source,
            change_pct,
            volume_24h,
            market_cap,
            fdv,
            volume_to_market_cap_pct,
            circulating_supply: instrument.circulating_supply,
            max_supply: instrument.max_supply,
        }
    }
}
