// =============================================================================
// Dashboard Actor — owns the selection and publishes the display view
// =============================================================================
//
// One task owns the ControlStateStore, the aggregate-ticker snapshot and the
// derived market table. It reacts to three inputs:
//
//   Tick::Fast     rebuild the view from what is already cached (no I/O)
//   Tick::Slow     spawn cache fills (chart, analysis, global overview) and
//                  the ticker fetch, rebuild
//   ControlRequest apply the command; a chart-key change spawns a fetch
//
// Fetches never run inline: they are spawned and report back over the event
// channel, so a slow upstream never delays a redraw. The current view is
// published as `Arc<DashboardView>` through a `watch` channel.
// =============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::control::{
    ControlCommand, ControlRequest, ControlStateStore, Pagination, Selection, TimeframeButton,
};
use crate::indicators::cycle::CycleIndicators;
use crate::indicators::sma::rolling_sma;
use crate::market_data::candle::CandleSeries;
use crate::market_data::global::{global_key, GlobalMarket};
use crate::market_data::overlay::{overlay, resolve_price, KeyMetrics};
use crate::market_data::price_table::LatestPriceTable;
use crate::market_data::series_cache::{
    CacheEntry, CandleSource, HistoricalSeriesCache, SeriesLookup,
};
use crate::market_data::tickers::{
    build_market_table, page_rows, performance_bars, top_movers, MarketRow, Movers,
    PerformanceBar, TickerSnapshot, TickerSource, TickerStat,
};
use crate::market_data::trade_stream::{FeedStatus, FeedStatusSnapshot};
use crate::runtime_config::RuntimeConfig;
use crate::scheduler::Tick;
use crate::types::{SeriesKey, Timeframe};

/// Period of the chart trend line.
const SMA_PERIOD: usize = 5;
/// Gainers / losers shown on each side.
const MOVERS_COUNT: usize = 5;
/// Daily series are refreshed at most this often.
const ANALYSIS_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);
const CONTROL_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 32;

// =============================================================================
// View
// =============================================================================

/// Data state of a cached series as seen by the front end.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SeriesStatus {
    Ready,
    /// Never fetched, or the first fetch is still in flight.
    Loading,
    /// The last fetch failed. Data (if any) is from the previous success.
    Stale { reason: String },
}

impl SeriesStatus {
    fn from_lookup(lookup: &SeriesLookup) -> Self {
        match lookup {
            SeriesLookup::Fresh(_) => Self::Ready,
            SeriesLookup::Pending => Self::Loading,
            SeriesLookup::Stale { reason, .. } => Self::Stale {
                reason: reason.clone(),
            },
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChartFrame {
    pub key: SeriesKey,
    pub status: SeriesStatus,
    pub fetched_at: Option<DateTime<Utc>>,
    /// Cached series with the live price overlaid onto its final candle.
    pub candles: CandleSeries,
    /// SMA trend line aligned with `candles`.
    pub sma: Vec<Option<f64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LivePrice {
    pub symbol: String,
    pub name: String,
    pub price: f64,
    /// `false` while the price is still the startup seed.
    pub live: bool,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MarketFrame {
    pub updated_at: Option<DateTime<Utc>>,
    pub page_size: usize,
    pub total_rows: usize,
    pub rows: Vec<MarketRow>,
    pub movers: Movers,
    pub performance: Vec<PerformanceBar>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnalysisFrame {
    pub key: SeriesKey,
    pub status: SeriesStatus,
    /// `None` until enough daily candles are cached.
    pub indicators: Option<CycleIndicators>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GlobalMarketFrame {
    pub key: SeriesKey,
    pub status: SeriesStatus,
    pub overview: Option<GlobalMarket>,
}

/// Everything the front end renders, rebuilt on every tick.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardView {
    pub version: u64,
    pub generated_at: DateTime<Utc>,
    pub quote_currency: String,
    pub selection: Selection,
    pub timeframes: Vec<TimeframeButton>,
    pub pagination: Pagination,
    pub chart: ChartFrame,
    pub metrics: Option<KeyMetrics>,
    pub prices: Vec<LivePrice>,
    pub market: MarketFrame,
    pub analysis: AnalysisFrame,
    pub global: GlobalMarketFrame,
    pub feed: FeedStatusSnapshot,
    /// Full ranked table, for paged reads outside the pushed view.
    #[serde(skip)]
    pub market_rows: Arc<Vec<MarketRow>>,
}

// =============================================================================
// Handle
// =============================================================================

/// Cheap, cloneable access to a running dashboard.
#[derive(Clone)]
pub struct DashboardHandle {
    view: watch::Receiver<Arc<DashboardView>>,
    control: mpsc::Sender<ControlRequest>,
}

impl DashboardHandle {
    pub fn view(&self) -> Arc<DashboardView> {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<DashboardView>> {
        self.view.clone()
    }

    /// Submit a control command and wait for the resulting selection.
    pub async fn send(&self, command: ControlCommand) -> Result<Selection> {
        let (reply, rx) = oneshot::channel();
        self.control
            .send(ControlRequest { command, reply })
            .await
            .map_err(|_| anyhow::anyhow!("dashboard is not running"))?;
        let outcome = rx
            .await
            .map_err(|_| anyhow::anyhow!("dashboard dropped the control request"))?;
        outcome.map_err(anyhow::Error::msg)
    }
}

// =============================================================================
// Actor
// =============================================================================

/// Clears the ticker in-flight flag even if the fetch task panics.
struct TickerFetchGuard(Arc<AtomicBool>);

impl Drop for TickerFetchGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

enum DashboardEvent {
    SeriesUpdated,
    Tickers(Result<Vec<TickerStat>>),
}

pub struct Dashboard<C, T> {
    config: Arc<RuntimeConfig>,
    prices: Arc<LatestPriceTable>,
    feed: Arc<FeedStatus>,
    chart_cache: Arc<HistoricalSeriesCache<C>>,
    analysis_cache: Arc<HistoricalSeriesCache<C>>,
    global_cache: Arc<HistoricalSeriesCache<C>>,
    tickers: Arc<T>,
    control: ControlStateStore,

    snapshot: Option<Arc<TickerSnapshot>>,
    market_rows: Arc<Vec<MarketRow>>,
    movers: Movers,
    performance: Vec<PerformanceBar>,
    cycle: Option<(Arc<CacheEntry>, Option<Arc<CycleIndicators>>)>,
    global: Option<(Arc<CacheEntry>, Option<Arc<GlobalMarket>>)>,
    tickers_in_flight: Arc<AtomicBool>,
    version: u64,

    ticks: mpsc::Receiver<Tick>,
    requests: mpsc::Receiver<ControlRequest>,
    events_tx: mpsc::Sender<DashboardEvent>,
    events: mpsc::Receiver<DashboardEvent>,
    timeframe_tx: watch::Sender<Timeframe>,
    view_tx: watch::Sender<Arc<DashboardView>>,
}

impl<C, T> Dashboard<C, T>
where
    C: CandleSource + Clone,
    T: TickerSource,
{
    /// Build the actor. Returns it together with the API handle and the
    /// receiver the refresh scheduler watches for timeframe changes.
    pub fn new(
        config: Arc<RuntimeConfig>,
        prices: Arc<LatestPriceTable>,
        feed: Arc<FeedStatus>,
        candles: C,
        tickers: T,
        ticks: mpsc::Receiver<Tick>,
    ) -> (Self, DashboardHandle, watch::Receiver<Timeframe>) {
        let control = ControlStateStore::new(
            &config.default_symbol,
            config.instruments.iter().map(|i| i.symbol.clone()),
            config.page_count,
        );
        let (timeframe_tx, timeframe_rx) = watch::channel(control.selection().timeframe);
        let (control_tx, requests) = mpsc::channel(CONTROL_BUFFER);
        let (events_tx, events) = mpsc::channel(EVENT_BUFFER);

        let (view_tx, view_rx) = watch::channel(Arc::new(placeholder_view()));

        let mut dashboard = Self {
            chart_cache: Arc::new(HistoricalSeriesCache::new("chart", candles.clone())),
            analysis_cache: Arc::new(HistoricalSeriesCache::new("analysis", candles.clone())),
            global_cache: Arc::new(HistoricalSeriesCache::new("global", candles)),
            tickers: Arc::new(tickers),
            control,
            snapshot: None,
            market_rows: Arc::new(Vec::new()),
            movers: Movers::default(),
            performance: Vec::new(),
            cycle: None,
            global: None,
            tickers_in_flight: Arc::new(AtomicBool::new(false)),
            version: 0,
            ticks,
            requests,
            events_tx,
            events,
            timeframe_tx,
            view_tx,
            config,
            prices,
            feed,
        };
        dashboard.publish();

        let handle = DashboardHandle {
            view: view_rx,
            control: control_tx,
        };
        (dashboard, handle, timeframe_rx)
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(symbol = %self.control.selection().symbol, "dashboard started");

        loop {
            tokio::select! {
                tick = self.ticks.recv() => match tick {
                    Some(tick) => self.on_tick(tick),
                    None => break,
                },
                request = self.requests.recv() => match request {
                    Some(request) => self.on_control(request),
                    // Every handle dropped: nothing can observe us any more.
                    None => break,
                },
                Some(event) = self.events.recv() => self.on_event(event),
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("dashboard stopped");
    }

    // -------------------------------------------------------------------------
    // Input handlers
    // -------------------------------------------------------------------------

    fn on_tick(&mut self, tick: Tick) {
        if tick == Tick::Slow {
            self.fill_chart();
            self.fill_analysis();
            self.spawn_fill(self.global_cache.clone(), global_key(), Some(ANALYSIS_MAX_AGE));
            self.fetch_tickers();
        }
        self.publish();
    }

    fn on_control(&mut self, request: ControlRequest) {
        let before = self.control.selection().clone();
        let outcome = self.control.apply(&request.command);

        let reply = match outcome {
            Ok(changed) => {
                if changed {
                    self.on_selection_changed(&before);
                }
                Ok(self.control.selection().clone())
            }
            Err(e) => {
                warn!(command = ?request.command, error = %e, "control command rejected");
                Err(format!("{e:#}"))
            }
        };
        // The requester may have gone away; nothing to do then.
        let _ = request.reply.send(reply);
    }

    fn on_selection_changed(&mut self, before: &Selection) {
        let after = self.control.selection().clone();
        if after.timeframe != before.timeframe {
            self.timeframe_tx.send_replace(after.timeframe);
        }
        if after.series_key() != before.series_key() {
            self.fill_chart();
        }
        if after.analysis_key() != before.analysis_key() {
            self.fill_analysis();
        }
        self.publish();
    }

    fn on_event(&mut self, event: DashboardEvent) {
        match event {
            DashboardEvent::SeriesUpdated => {}
            DashboardEvent::Tickers(Ok(stats)) => {
                let snapshot = TickerSnapshot::new(stats, Utc::now());
                self.apply_snapshot(snapshot);
            }
            DashboardEvent::Tickers(Err(e)) => {
                warn!(error = %e, "ticker refresh failed — keeping previous snapshot");
            }
        }
        self.publish();
    }

    // -------------------------------------------------------------------------
    // Fetch triggers (spawned, never awaited here)
    // -------------------------------------------------------------------------

    fn fill_chart(&self) {
        let selection = self.control.selection();
        let key = selection.series_key();
        let max_age = selection.timeframe.refetch_after();
        self.spawn_fill(self.chart_cache.clone(), key, max_age);
    }

    fn fill_analysis(&self) {
        let key = self.control.selection().analysis_key();
        self.spawn_fill(self.analysis_cache.clone(), key, Some(ANALYSIS_MAX_AGE));
    }

    fn spawn_fill(
        &self,
        cache: Arc<HistoricalSeriesCache<C>>,
        key: SeriesKey,
        max_age: Option<Duration>,
    ) {
        if let Some(entry) = cache.peek(&key).entry_for(&key) {
            let expired = max_age.is_some_and(|max| entry.age(Utc::now()) >= max);
            if !expired {
                return;
            }
        }
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let lookup = cache.ensure(&key, max_age).await;
            debug!(
                key = %key,
                stale = lookup.is_stale(),
                fetches = cache.fetch_count(),
                "series fill finished"
            );
            let _ = events.send(DashboardEvent::SeriesUpdated).await;
        });
    }

    fn fetch_tickers(&self) {
        if self.tickers_in_flight.swap(true, Ordering::AcqRel) {
            debug!("ticker fetch already in flight");
            return;
        }
        let tickers = self.tickers.clone();
        let guard = TickerFetchGuard(self.tickers_in_flight.clone());
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = tickers.fetch_tickers().await;
            drop(guard);
            let _ = events.send(DashboardEvent::Tickers(result)).await;
        });
    }

    // -------------------------------------------------------------------------
    // Derived state
    // -------------------------------------------------------------------------

    fn apply_snapshot(&mut self, snapshot: TickerSnapshot) {
        let limit = self.config.page_size * self.config.page_count;
        let rows = build_market_table(&snapshot, &self.config.instruments, limit);
        self.movers = top_movers(&rows, MOVERS_COUNT);
        self.performance = performance_bars(&snapshot, &self.config.instruments);
        info!(tickers = snapshot.len(), rows = rows.len(), "ticker snapshot updated");
        self.market_rows = Arc::new(rows);
        self.snapshot = Some(Arc::new(snapshot));
    }

    /// Cycle indicators for the cached analysis series, recomputed only when
    /// the cached entry changes.
    fn cycle_indicators(&mut self, entry: Option<&Arc<CacheEntry>>) -> Option<Arc<CycleIndicators>> {
        let entry = entry?;
        match &self.cycle {
            Some((cached, indicators)) if Arc::ptr_eq(cached, entry) => indicators.clone(),
            _ => {
                let indicators = CycleIndicators::compute(&entry.series).map(Arc::new);
                if indicators.is_none() {
                    debug!(key = %entry.key, candles = entry.series.len(), "not enough history for cycle indicators");
                }
                self.cycle = Some((entry.clone(), indicators.clone()));
                indicators
            }
        }
    }

    fn global_market(&mut self, entry: Option<&Arc<CacheEntry>>) -> Option<Arc<GlobalMarket>> {
        let entry = entry?;
        match &self.global {
            Some((cached, overview)) if Arc::ptr_eq(cached, entry) => overview.clone(),
            _ => {
                let overview = GlobalMarket::compute(&entry.series).map(Arc::new);
                self.global = Some((entry.clone(), overview.clone()));
                overview
            }
        }
    }

    fn build_view(&mut self) -> DashboardView {
        let selection = self.control.selection().clone();
        let ticker = self
            .snapshot
            .as_ref()
            .and_then(|s| s.get(&selection.symbol).cloned());

        // Chart + metrics
        let key = selection.series_key();
        let lookup = self.chart_cache.peek(&key);
        let entry = lookup.entry_for(&key).cloned();
        let price = resolve_price(
            self.prices.quote(&selection.symbol),
            ticker.as_ref(),
            entry.as_ref().map(|e| &e.series),
        );
        let candles = match (&entry, price) {
            (Some(entry), Some((price, _))) => overlay(&entry.series, price, selection.timeframe),
            (Some(entry), None) => entry.series.clone(),
            (None, _) => CandleSeries::default(),
        };
        let sma = rolling_sma(&candles.closes(), SMA_PERIOD);
        let chart = ChartFrame {
            key,
            status: SeriesStatus::from_lookup(&lookup),
            fetched_at: entry.as_ref().map(|e| e.fetched_at),
            candles,
            sma,
        };

        let metrics = match (self.config.instrument(&selection.symbol), price) {
            (Some(instrument), Some((price, source))) => {
                Some(KeyMetrics::compute(instrument, price, source, ticker.as_ref()))
            }
            _ => None,
        };

        // Live price strip
        let prices = self
            .config
            .instruments
            .iter()
            .filter_map(|i| {
                self.prices.quote(&i.symbol).map(|q| LivePrice {
                    symbol: i.symbol.clone(),
                    name: i.name.clone(),
                    price: q.price,
                    live: q.is_live(),
                    updated_at: q.updated_at,
                })
            })
            .collect();

        // Market table
        let market = MarketFrame {
            updated_at: self.snapshot.as_ref().map(|s| s.fetched_at),
            page_size: self.config.page_size,
            total_rows: self.market_rows.len(),
            rows: page_rows(&self.market_rows, selection.page, self.config.page_size).to_vec(),
            movers: self.movers.clone(),
            performance: self.performance.clone(),
        };

        // Cycle analysis
        let analysis_key = selection.analysis_key();
        let analysis_lookup = self.analysis_cache.peek(&analysis_key);
        let analysis_entry = analysis_lookup.entry_for(&analysis_key).cloned();
        let analysis = AnalysisFrame {
            indicators: self
                .cycle_indicators(analysis_entry.as_ref())
                .map(|c| c.as_ref().clone()),
            status: SeriesStatus::from_lookup(&analysis_lookup),
            key: analysis_key,
        };

        // Global overview
        let overview_key = global_key();
        let global_lookup = self.global_cache.peek(&overview_key);
        let global_entry = global_lookup.entry_for(&overview_key).cloned();
        let global = GlobalMarketFrame {
            overview: self
                .global_market(global_entry.as_ref())
                .map(|g| g.as_ref().clone()),
            status: SeriesStatus::from_lookup(&global_lookup),
            key: overview_key,
        };

        self.version += 1;
        DashboardView {
            version: self.version,
            generated_at: Utc::now(),
            quote_currency: self.config.quote_currency.clone(),
            timeframes: self.control.timeframe_buttons(),
            pagination: self.control.pagination(),
            selection,
            chart,
            metrics,
            prices,
            market,
            analysis,
            global,
            feed: self.feed.snapshot(),
            market_rows: self.market_rows.clone(),
        }
    }

    fn publish(&mut self) {
        let view = Arc::new(self.build_view());
        self.view_tx.send_replace(view);
    }
}

/// Initial channel value, replaced before any handle exists.
fn placeholder_view() -> DashboardView {
    let selection = Selection {
        symbol: String::new(),
        timeframe: Timeframe::default(),
        page: 1,
        analysis_symbol: String::new(),
    };
    DashboardView {
        version: 0,
        generated_at: Utc::now(),
        quote_currency: String::new(),
        chart: ChartFrame {
            key: selection.series_key(),
            status: SeriesStatus::Loading,
            fetched_at: None,
            candles: CandleSeries::default(),
            sma: Vec::new(),
        },
        analysis: AnalysisFrame {
            key: selection.analysis_key(),
            status: SeriesStatus::Loading,
            indicators: None,
        },
        global: GlobalMarketFrame {
            key: global_key(),
            status: SeriesStatus::Loading,
            overview: None,
        },
        selection,
        timeframes: Vec::new(),
        pagination: Pagination {
            page: 1,
            page_count: 1,
            prev_enabled: false,
            next_enabled: false,
        },
        metrics: None,
        prices: Vec::new(),
        market: MarketFrame {
            updated_at: None,
            page_size: 1,
            total_rows: 0,
            rows: Vec::new(),
            movers: Movers::default(),
            performance: Vec::new(),
        },
        feed: FeedStatus::default().snapshot(),
        market_rows: Arc::new(Vec::new()),
    }
}
