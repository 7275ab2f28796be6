// =============================================================================
// Stream Ingester — keeps the latest price table fed from the trade stream
// =============================================================================
//
// One background task holds a combined-stream WebSocket connection subscribed
// to a small fixed set of symbols. Every trade message is converted into the
// quote currency and written into the LatestPriceTable (the ingester is the
// table's only writer).
//
// Failure handling never reaches callers:
//   - malformed or unrelated frames are dropped at the parsing boundary,
//   - a failed or silent connection is re-established with exponential
//     backoff; the table keeps its last value in the meantime.
// =============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use super::candle::parse_string_f64;
use super::price_table::LatestPriceTable;
use crate::runtime_config::FeedParams;
use crate::types::CurrencyRate;

// ---------------------------------------------------------------------------
// Feed status
// ---------------------------------------------------------------------------

/// Lock-free counters describing the feed connection.
#[derive(Default)]
pub struct FeedStatus {
    connected: AtomicBool,
    connects: AtomicU64,
    trades: AtomicU64,
    dropped: AtomicU64,
}

/// Serialisable snapshot of [`FeedStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FeedStatusSnapshot {
    pub connected: bool,
    pub connects: u64,
    pub trades: u64,
    pub dropped: u64,
}

impl FeedStatus {
    pub fn trades(&self) -> u64 {
        self.trades.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> FeedStatusSnapshot {
        FeedStatusSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            trades: self.trades.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

// ---------------------------------------------------------------------------
// Backoff
// ---------------------------------------------------------------------------

/// Doubling reconnect delay, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        let initial = initial.max(Duration::from_millis(1));
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait before the next attempt; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ---------------------------------------------------------------------------
// Trade parsing
// ---------------------------------------------------------------------------

/// One trade extracted from the feed (price still in USD).
#[derive(Debug, Clone, PartialEq)]
pub struct TradeTick {
    pub symbol: String,
    pub price: f64,
}

/// Build the combined-stream URL subscribing to the trade channel of every
/// symbol.
pub fn build_trade_stream_url(base_url: &str, symbols: &[String]) -> String {
    let streams: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@trade", s.to_lowercase()))
        .collect();
    format!(
        "{}/stream?streams={}",
        base_url.trim_end_matches('/'),
        streams.join("/")
    )
}

/// Parse a trade message.
///
/// Accepts both the combined-stream envelope and a bare payload:
/// ```json
/// { "stream": "btcusdt@trade", "data": { "e": "trade", "s": "BTCUSDT", "p": "37000.00" } }
/// { "e": "trade", "s": "BTCUSDT", "p": "37000.00" }
/// ```
pub fn parse_trade(text: &str) -> Result<TradeTick> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let data = if root.get("data").is_some() {
        &root["data"]
    } else {
        &root
    };

    if let Some(event) = data["e"].as_str() {
        if event != "trade" && event != "aggTrade" {
            anyhow::bail!("unexpected event type {event}");
        }
    }

    let symbol = data["s"]
        .as_str()
        .context("missing field s")?
        .to_uppercase();
    let price = parse_string_f64(&data["p"], "p")?;

    if !price.is_finite() || price <= 0.0 {
        anyhow::bail!("non-positive price {price} for {symbol}");
    }

    Ok(TradeTick { symbol, price })
}

// ---------------------------------------------------------------------------
// StreamIngester
// ---------------------------------------------------------------------------

/// Settings for one ingester instance.
#[derive(Debug, Clone)]
pub struct IngesterSettings {
    pub base_url: String,
    pub symbols: Vec<String>,
    pub rate: CurrencyRate,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub ping_interval: Duration,
    pub stale_timeout: Duration,
}

impl IngesterSettings {
    pub fn from_feed(feed: &FeedParams, symbols: Vec<String>, rate: CurrencyRate) -> Self {
        Self {
            base_url: feed.stream_base_url.clone(),
            symbols,
            rate,
            reconnect_initial: Duration::from_millis(feed.reconnect_initial_ms),
            reconnect_max: Duration::from_millis(feed.reconnect_max_ms),
            ping_interval: Duration::from_secs(feed.ping_interval_secs.max(1)),
            stale_timeout: Duration::from_secs(feed.stale_timeout_secs.max(1)),
        }
    }
}

/// Background writer of the [`LatestPriceTable`].
pub struct StreamIngester {
    settings: IngesterSettings,
    url: String,
    prices: Arc<LatestPriceTable>,
    status: Arc<FeedStatus>,
}

impl StreamIngester {
    /// Symbols with no slot in `prices` are not subscribed.
    pub fn new(mut settings: IngesterSettings, prices: Arc<LatestPriceTable>) -> Self {
        settings.symbols.retain(|symbol| {
            let tracked = prices.is_tracked(symbol);
            if !tracked {
                warn!(%symbol, "stream symbol has no price slot — not subscribed");
            }
            tracked
        });
        let url = build_trade_stream_url(&settings.base_url, &settings.symbols);
        Self {
            settings,
            url,
            prices,
            status: Arc::new(FeedStatus::default()),
        }
    }

    pub fn status(&self) -> Arc<FeedStatus> {
        self.status.clone()
    }

    /// Spawn the ingester on the runtime. The task ends when `shutdown`
    /// flips to `true` (or its sender is dropped).
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Connect, ingest, and reconnect forever until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.settings.symbols.is_empty() {
            warn!("no stream symbols configured — price feed disabled");
            return;
        }

        let mut backoff = Backoff::new(self.settings.reconnect_initial, self.settings.reconnect_max);
        info!(url = %self.url, "stream ingester started");

        loop {
            let trades_before = self.status.trades();

            tokio::select! {
                _ = shutdown.changed() => break,
                result = self.run_connection() => {
                    self.status.connected.store(false, Ordering::Relaxed);
                    match result {
                        Ok(()) => warn!("trade stream ended"),
                        Err(e) => error!(error = %e, "trade stream error"),
                    }
                }
            }

            if self.status.trades() > trades_before {
                backoff.reset();
            }
            let delay = backoff.next_delay();
            info!(delay_ms = delay.as_millis() as u64, "reconnecting trade stream");

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.status.connected.store(false, Ordering::Relaxed);
        info!("stream ingester stopped");
    }

    /// One connection lifetime. Returns when the server closes the stream or
    /// an error / silence timeout occurs.
    async fn run_connection(&self) -> Result<()> {
        info!(url = %self.url, "connecting to trade WebSocket");

        let (ws_stream, _response) =
            tokio::time::timeout(self.settings.stale_timeout, connect_async(&self.url))
                .await
                .context("timed out connecting to trade WebSocket")?
                .context("failed to connect to trade WebSocket")?;

        self.status.connected.store(true, Ordering::Relaxed);
        self.status.connects.fetch_add(1, Ordering::Relaxed);
        info!(symbols = ?self.settings.symbols, "trade WebSocket connected");

        let (mut write, mut read) = ws_stream.split();
        let mut keepalive = tokio::time::interval(self.settings.ping_interval);
        keepalive.tick().await;

        // Pushed back only by inbound frames; our own pings do not count.
        let silence = tokio::time::sleep(self.settings.stale_timeout);
        tokio::pin!(silence);

        loop {
            tokio::select! {
                _ = keepalive.tick() => {
                    write
                        .send(Message::Ping(Vec::new()))
                        .await
                        .context("failed to send keepalive ping")?;
                }
                _ = &mut silence => {
                    anyhow::bail!(
                        "trade WebSocket silent for {} ms",
                        self.settings.stale_timeout.as_millis()
                    );
                }
                frame = read.next() => {
                    silence
                        .as_mut()
                        .reset(tokio::time::Instant::now() + self.settings.stale_timeout);
                    match frame {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text),
                        Some(Ok(Message::Close(_))) => {
                            warn!("trade WebSocket closed by server");
                            return Ok(());
                        }
                        // Ping / Pong / Binary frames: tungstenite answers pings itself.
                        Some(Ok(_)) => {}
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    }
                }
            }
        }
    }

    fn handle_text(&self, text: &str) {
        match parse_trade(text) {
            Ok(tick) => {
                let price = self.settings.rate.apply(tick.price);
                if self.prices.set(&tick.symbol, price) {
                    self.status.trades.fetch_add(1, Ordering::Relaxed);
                } else {
                    debug!(symbol = %tick.symbol, "trade for untracked symbol ignored");
                }
            }
            Err(e) => {
                self.status.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "dropped trade stream message");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    fn trade_json(symbol: &str, price: &str) -> String {
        format!(
            r#"{{"stream":"{}@trade","data":{{"e":"trade","E":1700000000000,"s":"{}","t":1,"p":"{}","q":"0.01","T":1700000000000,"m":false}}}}"#,
            symbol.to_lowercase(),
            symbol,
            price
        )
    }

    fn settings(base_url: String) -> IngesterSettings {
        IngesterSettings {
            base_url,
            symbols: vec!["BTCUSDT".to_string()],
            rate: CurrencyRate(2.0),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(100),
            ping_interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(5),
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not met in time");
    }

    #[test]
    fn build_url_contains_streams() {
        let url = build_trade_stream_url(
            "wss://stream.binance.com:9443/",
            &["BTCUSDT".to_string(), "ETHUSDT".to_string()],
        );
        assert_eq!(
            url,
            "wss://stream.binance.com:9443/stream?streams=btcusdt@trade/ethusdt@trade"
        );
    }

    #[test]
    fn parse_combined_envelope() {
        let tick = parse_trade(&trade_json("BTCUSDT", "37020.50")).expect("should parse");
        assert_eq!(tick.symbol, "BTCUSDT");
        assert!((tick.price - 37020.5).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_bare_payload() {
        let tick = parse_trade(r#"{"e":"trade","s":"ethusdt","p":"2000"}"#).unwrap();
        assert_eq!(tick.symbol, "ETHUSDT");
        assert!((tick.price - 2000.0).abs() < f64::EPSILON);
    }

    #[test]
    fn malformed_messages_are_rejected() {
        assert!(parse_trade("not json").is_err());
        assert!(parse_trade(r#"{"result":null,"id":1}"#).is_err());
        assert!(parse_trade(r#"{"e":"trade","s":"BTCUSDT"}"#).is_err());
        assert!(parse_trade(r#"{"e":"trade","s":"BTCUSDT","p":"-1"}"#).is_err());
        assert!(parse_trade(r#"{"e":"kline","s":"BTCUSDT","p":"1"}"#).is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut b = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(100));
        assert_eq!(b.next_delay(), Duration::from_millis(200));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        assert_eq!(b.next_delay(), Duration::from_millis(350));
        b.reset();
        assert_eq!(b.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn handle_text_applies_rate_and_counts_drops() {
        let prices = Arc::new(LatestPriceTable::new(["BTCUSDT"], 0.0));
        let ingester = StreamIngester::new(settings("ws://unused".into()), prices.clone());

        ingester.handle_text(&trade_json("BTCUSDT", "100.0"));
        ingester.handle_text("{garbage");

        assert_eq!(prices.price("BTCUSDT"), Some(200.0));
        let status = ingester.status().snapshot();
        assert_eq!(status.trades, 1);
        assert_eq!(status.dropped, 1);
    }

    #[tokio::test]
    async fn updates_resume_after_feed_disconnect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let prices = Arc::new(LatestPriceTable::new(["BTCUSDT"], 0.0));
        let ingester = StreamIngester::new(settings(format!("ws://{addr}")), prices.clone());
        let status = ingester.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ingester.spawn(shutdown_rx);

        // First connection: one trade, then the server goes away.
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        ws.send(Message::Text(trade_json("BTCUSDT", "100.0")))
            .await
            .unwrap();
        wait_for(|| prices.price("BTCUSDT") == Some(200.0)).await;
        ws.close(None).await.ok();
        drop(ws);

        // While disconnected the table keeps the last value.
        assert_eq!(prices.price("BTCUSDT"), Some(200.0));

        // Second connection without restarting anything.
        let (tcp, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
            .await
            .expect("ingester should reconnect")
            .unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        ws.send(Message::Text(trade_json("BTCUSDT", "150.0")))
            .await
            .unwrap();
        wait_for(|| prices.price("BTCUSDT") == Some(300.0)).await;

        assert!(status.snapshot().connects >= 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("ingester should stop on shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn silent_connection_is_dropped_and_redialled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let prices = Arc::new(LatestPriceTable::new(["BTCUSDT"], 0.0));
        let ingester = StreamIngester::new(
            IngesterSettings {
                ping_interval: Duration::from_millis(200),
                stale_timeout: Duration::from_millis(600),
                ..settings(format!("ws://{addr}"))
            },
            prices.clone(),
        );
        let status = ingester.status();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = ingester.spawn(shutdown_rx);

        // Accept, then never read or write: pings go unanswered.
        let (tcp, _) = listener.accept().await.unwrap();
        let _silent = accept_async(tcp).await.unwrap();
        wait_for(|| status.snapshot().connected).await;

        let (tcp, _) = tokio::time::timeout(Duration::from_secs(3), listener.accept())
            .await
            .expect("silent connection should be abandoned within the stale timeout")
            .unwrap();
        let mut ws = accept_async(tcp).await.unwrap();
        ws.send(Message::Text(trade_json("BTCUSDT", "120.0")))
            .await
            .unwrap();
        wait_for(|| prices.price("BTCUSDT") == Some(240.0)).await;
        assert!(status.snapshot().connects >= 2);

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("ingester should stop on shutdown")
            .unwrap();
    }
}
