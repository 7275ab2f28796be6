// =============================================================================
// Binance REST API Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used: historical klines and the aggregate
// 24h tickers. Prices and quote volumes are converted into the quote currency
// here, once, so nothing downstream has to know about the rate.
//
// Every request is checked against the weight tracker first; a request that
// would push the minute's weight over the hard cap fails locally and is
// retried by the caller on a later tick.
// =============================================================================

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, instrument, warn};

use super::rate_limit::RateLimitTracker;
use crate::market_data::candle::{parse_string_f64, Candle, CandleSeries};
use crate::market_data::series_cache::CandleSource;
use crate::market_data::tickers::{TickerSource, TickerStat};
use crate::types::{CurrencyRate, SeriesKey};

/// Request weight of one klines call.
const KLINES_WEIGHT: u32 = 2;
/// Request weight of the all-symbols 24h ticker call.
const TICKERS_24H_WEIGHT: u32 = 80;

/// Binance REST API client for public market data. Cheap to clone.
#[derive(Clone)]
pub struct BinanceClient {
    base_url: String,
    client: reqwest::Client,
    rate: CurrencyRate,
    limits: Arc<RateLimitTracker>,
}

impl BinanceClient {
    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `base_url` — REST base URL without trailing slash.
    /// * `timeout`  — transport timeout applied to every request.
    /// * `rate`     — quote-currency conversion applied to prices and volumes.
    pub fn new(base_url: impl Into<String>, timeout: Duration, rate: CurrencyRate) -> Result<Self> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        debug!(base_url = %base_url, "BinanceClient initialised");

        Ok(Self {
            base_url,
            client,
            rate,
            limits: Arc::new(RateLimitTracker::new()),
        })
    }

    /// Shared weight tracker (for the health endpoint).
    pub fn rate_limits(&self) -> Arc<RateLimitTracker> {
        self.limits.clone()
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    /// GET /api/v3/klines (public — no signature required).
    ///
    /// Array indices:
    ///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
    ///   [6] closeTime, [7] quoteAssetVolume, [8] numberOfTrades, ...
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<CandleSeries> {
        let url = format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url, symbol, interval, limit
        );
        let body = self.get_json(&url, KLINES_WEIGHT, "/api/v3/klines").await?;
        let series = parse_klines(&body, self.rate)?;

        debug!(symbol, interval, count = series.len(), "klines fetched");
        Ok(series)
    }

    /// GET /api/v3/ticker/24hr for every symbol.
    #[instrument(skip(self), name = "binance::get_tickers_24h")]
    pub async fn get_tickers_24h(&self) -> Result<Vec<TickerStat>> {
        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let body = self
            .get_json(&url, TICKERS_24H_WEIGHT, "/api/v3/ticker/24hr")
            .await?;
        let stats = parse_tickers(&body, self.rate)?;

        debug!(count = stats.len(), "24h tickers fetched");
        Ok(stats)
    }

    // -------------------------------------------------------------------------
    // Internal helpers
    // -------------------------------------------------------------------------

    async fn get_json(&self, url: &str, weight: u32, endpoint: &str) -> Result<serde_json::Value> {
        if !self.limits.can_send_request(weight) {
            anyhow::bail!("GET {endpoint} refused locally: request weight limit reached");
        }

        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {endpoint} request failed"))?;

        self.limits.update_from_headers(resp.headers());

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse {endpoint} response"))?;

        if !status.is_success() {
            anyhow::bail!("Binance GET {} returned {}: {}", endpoint, status, body);
        }
        Ok(body)
    }
}

impl std::fmt::Debug for BinanceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceClient")
            .field("base_url", &self.base_url)
            .field("rate", &self.rate.0)
            .field("limits", &self.limits)
            .finish()
    }
}

impl CandleSource for BinanceClient {
    fn fetch_series(&self, key: &SeriesKey) -> impl Future<Output = Result<CandleSeries>> + Send {
        let client = self.clone();
        let key = key.clone();
        async move { client.get_klines(&key.symbol, &key.interval, key.limit).await }
    }
}

impl TickerSource for BinanceClient {
    fn fetch_tickers(&self) -> impl Future<Output = Result<Vec<TickerStat>>> + Send {
        let client = self.clone();
        async move { client.get_tickers_24h().await }
    }
}

// ---------------------------------------------------------------------------
// Response parsing
// ---------------------------------------------------------------------------

fn parse_kline_row(arr: &[serde_json::Value], rate: CurrencyRate) -> Result<Candle> {
    let open_time = arr[0].as_i64().context("openTime is not an integer")?;
    let close_time = arr[6].as_i64().context("closeTime is not an integer")?;
    Ok(Candle {
        open_time,
        close_time,
        open: rate.apply(parse_string_f64(&arr[1], "open")?),
        high: rate.apply(parse_string_f64(&arr[2], "high")?),
        low: rate.apply(parse_string_f64(&arr[3], "low")?),
        close: rate.apply(parse_string_f64(&arr[4], "close")?),
        volume: parse_string_f64(&arr[5], "volume")?,
        quote_volume: rate.apply(parse_string_f64(&arr[7], "quoteVolume")?),
        trades_count: arr[8].as_u64().unwrap_or(0),
    })
}

/// Parse a klines response. Malformed rows are skipped; a body that is not an
/// array is an error.
pub fn parse_klines(body: &serde_json::Value, rate: CurrencyRate) -> Result<CandleSeries> {
    let raw = body.as_array().context("klines response is not an array")?;

    let mut candles = Vec::with_capacity(raw.len());
    for entry in raw {
        let Some(arr) = entry.as_array().filter(|a| a.len() >= 9) else {
            warn!(entry = %entry, "skipping malformed kline entry");
            continue;
        };
        match parse_kline_row(arr, rate) {
            Ok(candle) => candles.push(candle),
            Err(e) => warn!(error = %e, "skipping malformed kline entry"),
        }
    }

    Ok(CandleSeries::from_candles(candles))
}

fn parse_ticker(entry: &serde_json::Value, rate: CurrencyRate) -> Result<TickerStat> {
    let symbol = entry["symbol"]
        .as_str()
        .context("ticker missing symbol")?
        .to_string();
    Ok(TickerStat {
        last_price: rate.apply(parse_string_f64(&entry["lastPrice"], "lastPrice")?),
        change_pct: parse_string_f64(&entry["priceChangePercent"], "priceChangePercent")?,
        quote_volume: rate.apply(parse_string_f64(&entry["quoteVolume"], "quoteVolume")?),
        symbol,
    })
}

/// Parse a 24h ticker response. Malformed entries are skipped.
pub fn parse_tickers(body: &serde_json::Value, rate: CurrencyRate) -> Result<Vec<TickerStat>> {
    let raw = body
        .as_array()
        .context("ticker/24hr response is not an array")?;

    let mut stats = Vec::with_capacity(raw.len());
    let mut skipped = 0usize;
    for entry in raw {
        match parse_ticker(entry, rate) {
            Ok(stat) => stats.push(stat),
            Err(_) => skipped += 1,
        }
    }
    if skipped > 0 {
        debug!(skipped, "skipped malformed ticker entries");
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binance::rate_limit::WEIGHT_HEADER;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    fn kline(open_time: i64, close: &str) -> serde_json::Value {
        json!([open_time, "1.0", "3.0", "0.5", close, "10.0", open_time + 59_999, "20.0", 7, "0", "0", "0"])
    }

    #[test]
    fn klines_are_converted_and_normalised() {
        let body = json!([kline(60_000, "2.0"), kline(0, "1.5")]);
        let series = parse_klines(&body, CurrencyRate(84.0)).unwrap();
        assert_eq!(series.len(), 2);
        let first = &series.candles()[0];
        assert_eq!(first.open_time, 0);
        assert!((first.close - 126.0).abs() < 1e-9);
        assert!((first.high - 252.0).abs() < 1e-9);
        assert!((first.volume - 10.0).abs() < 1e-9);
        assert!((first.quote_volume - 1680.0).abs() < 1e-9);
        assert_eq!(first.trades_count, 7);
    }

    #[test]
    fn malformed_kline_rows_are_skipped() {
        let body = json!([kline(0, "1.0"), [1, 2], "garbage", kline(60_000, "oops")]);
        let series = parse_klines(&body, CurrencyRate::IDENTITY).unwrap();
        assert_eq!(series.len(), 1);
        assert!(parse_klines(&json!({"code": -1121}), CurrencyRate::IDENTITY).is_err());
    }

    #[test]
    fn tickers_convert_price_and_volume_but_not_percent() {
        let body = json!([
            {"symbol": "BTCUSDT", "lastPrice": "100.0", "priceChangePercent": "-1.5", "quoteVolume": "10.0"},
            {"symbol": "BROKEN", "lastPrice": null},
        ]);
        let stats = parse_tickers(&body, CurrencyRate(2.0)).unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].last_price, 200.0);
        assert_eq!(stats[0].change_pct, -1.5);
        assert_eq!(stats[0].quote_volume, 20.0);
    }

    async fn serve(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn fetch_series_hits_klines_and_tracks_weight() {
        let router = Router::new().route(
            "/api/v3/klines",
            get(|| async {
                let mut headers = HeaderMap::new();
                headers.insert(WEIGHT_HEADER, "42".parse().unwrap());
                (headers, Json(json!([kline(0, "1.0"), kline(60_000, "2.0")])))
            }),
        );
        let base = serve(router).await;
        let client = BinanceClient::new(base, Duration::from_secs(5), CurrencyRate::IDENTITY).unwrap();

        let series = client
            .fetch_series(&SeriesKey::new("BTCUSDT", "1m", 2))
            .await
            .unwrap();
        assert_eq!(series.len(), 2);
        assert_eq!(client.rate_limits().used_weight(), 42);
    }

    #[tokio::test]
    async fn http_error_status_is_a_fetch_failure() {
        let router = Router::new().route(
            "/api/v3/ticker/24hr",
            get(|| async {
                (
                    axum::http::StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({"code": -1003, "msg": "Too many requests"})),
                )
            }),
        );
        let base = serve(router).await;
        let client = BinanceClient::new(base, Duration::from_secs(5), CurrencyRate::IDENTITY).unwrap();
        let err = client.fetch_tickers().await.unwrap_err();
        assert!(format!("{err:#}").contains("429"));
    }
}
