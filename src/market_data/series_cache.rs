// =============================================================================
// Historical Series Cache — memoised candle series, fetched on key change
// =============================================================================
//
// Holds exactly one entry: the series for the most recently fetched key
// (instrument, granularity, count). Contract:
//
//   get_or_fetch(key)
//     - stored key == key          => cached payload, no I/O
//     - stored key != key          => fetch upstream; on success replace key
//                                     and payload together
//     - fetch for key in flight    => coalesced: return the current lookup
//                                     immediately, no second request
//     - fetch fails                => key is NOT advanced; the last good entry
//                                     is retained and the lookup reports Stale
//                                     until the next fetch for that key starts
//
// A fetch whose key was superseded by a newer request is discarded on arrival,
// so a slow response can never replace the series the user is now looking at.
// Entries are immutable behind `Arc`; display code copies before patching.
// =============================================================================

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::candle::CandleSeries;
use crate::types::SeriesKey;

/// Upstream provider of historical candles.
pub trait CandleSource: Send + Sync + 'static {
    fn fetch_series(&self, key: &SeriesKey) -> impl Future<Output = Result<CandleSeries>> + Send;
}

/// One cached series. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub key: SeriesKey,
    pub series: CandleSeries,
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }
}

/// Result of reading the cache for a key.
#[derive(Debug, Clone)]
pub enum SeriesLookup {
    /// The stored entry belongs to the requested key.
    Fresh(Arc<CacheEntry>),
    /// The last fetch for the requested key failed. `retained` is the last
    /// good entry, which may belong to a different key.
    Stale {
        retained: Option<Arc<CacheEntry>>,
        reason: String,
    },
    /// No data for this key yet (never fetched, or a fetch is in flight).
    Pending,
}

impl SeriesLookup {
    /// The entry usable for `key`: fresh, or retained-but-stale with a
    /// matching key. Never returns another key's data.
    pub fn entry_for(&self, key: &SeriesKey) -> Option<&Arc<CacheEntry>> {
        match self {
            Self::Fresh(entry) => Some(entry),
            Self::Stale {
                retained: Some(entry),
                ..
            } if entry.key == *key => Some(entry),
            _ => None,
        }
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Stale { .. })
    }
}

#[derive(Default)]
struct CacheInner {
    entry: Option<Arc<CacheEntry>>,
    /// Key of the most recent fetch request.
    wanted: Option<SeriesKey>,
    in_flight: HashSet<SeriesKey>,
    failure: Option<(SeriesKey, String)>,
}

impl CacheInner {
    fn matching(&self, key: &SeriesKey) -> Option<&Arc<CacheEntry>> {
        self.entry.as_ref().filter(|e| e.key == *key)
    }

    fn lookup(&self, key: &SeriesKey) -> SeriesLookup {
        if let Some((failed, reason)) = &self.failure {
            if failed == key {
                return SeriesLookup::Stale {
                    retained: self.entry.clone(),
                    reason: reason.clone(),
                };
            }
        }
        match self.matching(key) {
            Some(entry) => SeriesLookup::Fresh(entry.clone()),
            None => SeriesLookup::Pending,
        }
    }
}

/// Clears the in-flight marker even if the fetching future is dropped early.
struct InFlightGuard<'a> {
    inner: &'a Mutex<CacheInner>,
    key: SeriesKey,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.inner.lock().in_flight.remove(&self.key);
    }
}

/// Single-entry memoising cache in front of a [`CandleSource`].
pub struct HistoricalSeriesCache<S> {
    name: &'static str,
    source: S,
    inner: Mutex<CacheInner>,
    fetches: AtomicU64,
}

impl<S: CandleSource> HistoricalSeriesCache<S> {
    pub fn new(name: &'static str, source: S) -> Self {
        Self {
            name,
            source,
            inner: Mutex::new(CacheInner::default()),
            fetches: AtomicU64::new(0),
        }
    }

    /// Read without any I/O.
    pub fn peek(&self, key: &SeriesKey) -> SeriesLookup {
        self.inner.lock().lookup(key)
    }

    /// Return the cached series for `key`, fetching it first on a miss.
    pub async fn get_or_fetch(&self, key: &SeriesKey) -> SeriesLookup {
        {
            let inner = self.inner.lock();
            if let Some(entry) = inner.matching(key) {
                return SeriesLookup::Fresh(entry.clone());
            }
        }
        self.fetch(key).await
    }

    /// Fetch `key` again even if it is cached. The current entry stays
    /// visible until the new series lands.
    pub async fn refresh(&self, key: &SeriesKey) -> SeriesLookup {
        self.fetch(key).await
    }

    /// `get_or_fetch`, plus a refresh once the cached entry is older than
    /// `max_age` (`None` = never expire).
    pub async fn ensure(&self, key: &SeriesKey, max_age: Option<Duration>) -> SeriesLookup {
        let expired = {
            let inner = self.inner.lock();
            match (inner.matching(key), max_age) {
                (Some(entry), Some(max_age)) => entry.age(Utc::now()) >= max_age,
                _ => false,
            }
        };
        if expired {
            debug!(cache = self.name, key = %key, "cached series expired — refreshing");
            self.refresh(key).await
        } else {
            self.get_or_fetch(key).await
        }
    }

    /// Number of upstream requests issued since construction.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    async fn fetch(&self, key: &SeriesKey) -> SeriesLookup {
        {
            let mut inner = self.inner.lock();
            inner.wanted = Some(key.clone());
            if !inner.in_flight.insert(key.clone()) {
                debug!(cache = self.name, key = %key, "fetch already in flight — coalesced");
                return inner.lookup(key);
            }
            // A retry is loading again, not stale.
            if inner.failure.as_ref().is_some_and(|(k, _)| k == key) {
                inner.failure = None;
            }
        }

        let guard = InFlightGuard {
            inner: &self.inner,
            key: key.clone(),
        };
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(cache = self.name, key = %key, "fetching series upstream");

        let result = self.source.fetch_series(key).await;
        drop(guard);

        let mut inner = self.inner.lock();
        match result {
            Ok(series) if series.is_empty() => {
                warn!(cache = self.name, key = %key, "upstream returned no candles");
                inner.failure = Some((key.clone(), "upstream returned no candles".to_string()));
            }
            Ok(series) => {
                if inner.wanted.as_ref() != Some(key) {
                    debug!(cache = self.name, key = %key, "discarding superseded series");
                    return inner.lookup(key);
                }
                info!(cache = self.name, key = %key, candles = series.len(), "series cached");
                inner.entry = Some(Arc::new(CacheEntry {
                    key: key.clone(),
                    series,
                    fetched_at: Utc::now(),
                }));
                // Any recorded failure belongs to this key or to one it replaced.
                inner.failure = None;
            }
            Err(e) => {
                warn!(cache = self.name, key = %key, error = %e, "series fetch failed — keeping last good entry");
                inner.failure = Some((key.clone(), format!("{e:#}")));
            }
        }
        inner.lookup(key)
    }
}

impl<S> std::fmt::Debug for HistoricalSeriesCache<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("HistoricalSeriesCache")
            .field("name", &self.name)
            .field("key", &inner.entry.as_ref().map(|e| e.key.to_string()))
            .field("in_flight", &inner.in_flight.len())
            .field("fetches", &self.fetches.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::market_data::candle::tests::sample_series;
    use crate::types::Timeframe;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::Semaphore;

    /// In-memory candle source. Close prices start at 100 for 1m series and
    /// 500 for everything else, so payloads of different keys differ.
    #[derive(Default)]
    pub(crate) struct MockSource {
        pub calls: AtomicUsize,
        pub fail: AtomicBool,
        gates: parking_lot::Mutex<HashMap<SeriesKey, Arc<Semaphore>>>,
    }

    impl MockSource {
        /// Block fetches for `key` until [`MockSource::open`] is called.
        pub fn gate(&self, key: &SeriesKey) {
            self.gates.lock().insert(key.clone(), Arc::new(Semaphore::new(0)));
        }

        pub fn open(&self, key: &SeriesKey) {
            if let Some(gate) = self.gates.lock().get(key) {
                gate.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl CandleSource for MockSource {
        fn fetch_series(
            &self,
            key: &SeriesKey,
        ) -> impl Future<Output = Result<CandleSeries>> + Send {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let fail = self.fail.load(Ordering::SeqCst);
            let gate = self.gates.lock().get(key).cloned();
            let len = key.limit as usize;
            let base = if key.interval == "1m" { 100.0 } else { 500.0 };
            async move {
                if let Some(gate) = gate {
                    let _permit = gate.acquire_owned().await?;
                }
                if fail {
                    anyhow::bail!("upstream unavailable");
                }
                Ok(sample_series(len, base))
            }
        }
    }

    impl CandleSource for Arc<MockSource> {
        fn fetch_series(
            &self,
            key: &SeriesKey,
        ) -> impl Future<Output = Result<CandleSeries>> + Send {
            self.as_ref().fetch_series(key)
        }
    }

    fn live_key() -> SeriesKey {
        SeriesKey::for_timeframe("BTCUSDT", Timeframe::Live)
    }

    fn day_key() -> SeriesKey {
        SeriesKey::for_timeframe("BTCUSDT", Timeframe::Day)
    }

    async fn wait_for_calls(source: &MockSource, n: usize) {
        for _ in 0..200 {
            if source.calls() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {n} upstream calls");
    }

    #[tokio::test]
    async fn repeated_reads_fetch_once() {
        let cache = HistoricalSeriesCache::new("chart", MockSource::default());
        let key = live_key();

        let first = cache.get_or_fetch(&key).await;
        let entry = first.entry_for(&key).cloned().expect("fresh entry");
        for _ in 0..5 {
            let again = cache.get_or_fetch(&key).await;
            let again = again.entry_for(&key).expect("fresh entry");
            assert!(Arc::ptr_eq(&entry, again));
        }
        assert_eq!(cache.fetch_count(), 1);
        assert_eq!(entry.series.len(), 50);
    }

    #[tokio::test]
    async fn key_change_fetches_once_and_replaces_payload() {
        let cache = HistoricalSeriesCache::new("chart", MockSource::default());
        let live = cache.get_or_fetch(&live_key()).await;
        let live_entry = live.entry_for(&live_key()).cloned().unwrap();

        let day = cache.get_or_fetch(&day_key()).await;
        let day_entry = day.entry_for(&day_key()).cloned().unwrap();

        assert_eq!(cache.fetch_count(), 2);
        assert_eq!(day_entry.series.len(), 96);
        assert_ne!(day_entry.series, live_entry.series);
        // Old key is no longer served.
        assert!(matches!(cache.peek(&live_key()), SeriesLookup::Pending));
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_key_and_payload() {
        let source = Arc::new(MockSource::default());
        let cache = HistoricalSeriesCache::new("chart", source.clone());
        cache.get_or_fetch(&live_key()).await;

        source.fail.store(true, Ordering::SeqCst);
        let lookup = cache.get_or_fetch(&day_key()).await;

        assert!(lookup.is_stale());
        assert!(lookup.entry_for(&day_key()).is_none());
        match &lookup {
            SeriesLookup::Stale { retained, reason } => {
                assert_eq!(retained.as_ref().unwrap().key, live_key());
                assert!(reason.contains("upstream unavailable"));
            }
            other => panic!("expected stale, got {other:?}"),
        }
        // Previous key is still served as-is.
        assert!(matches!(cache.peek(&live_key()), SeriesLookup::Fresh(_)));

        // Next trigger retries and recovers.
        source.fail.store(false, Ordering::SeqCst);
        let lookup = cache.get_or_fetch(&day_key()).await;
        assert!(matches!(lookup, SeriesLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn failure_without_any_entry_reports_no_data() {
        let source = Arc::new(MockSource::default());
        source.fail.store(true, Ordering::SeqCst);
        let cache = HistoricalSeriesCache::new("chart", source);
        let lookup = cache.get_or_fetch(&live_key()).await;
        match lookup {
            SeriesLookup::Stale { retained, .. } => assert!(retained.is_none()),
            other => panic!("expected stale, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn concurrent_triggers_are_coalesced() {
        let source = Arc::new(MockSource::default());
        let key = live_key();
        source.gate(&key);
        let cache = Arc::new(HistoricalSeriesCache::new("chart", source.clone()));

        let task = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.get_or_fetch(&key).await })
        };
        wait_for_calls(&source, 1).await;

        // Second trigger while the first is outstanding: no new request.
        let lookup = cache.get_or_fetch(&key).await;
        assert!(matches!(lookup, SeriesLookup::Pending));
        assert_eq!(source.calls(), 1);

        source.open(&key);
        let lookup = task.await.unwrap();
        assert!(matches!(lookup, SeriesLookup::Fresh(_)));
        assert_eq!(cache.fetch_count(), 1);
    }

    #[tokio::test]
    async fn superseded_fetch_is_discarded() {
        let source = Arc::new(MockSource::default());
        source.gate(&live_key());
        let cache = Arc::new(HistoricalSeriesCache::new("chart", source.clone()));

        let slow = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_fetch(&live_key()).await })
        };
        wait_for_calls(&source, 1).await;

        // User switches to 24H while LIVE is still loading.
        let day = cache.get_or_fetch(&day_key()).await;
        assert!(matches!(day, SeriesLookup::Fresh(_)));

        source.open(&live_key());
        let late = slow.await.unwrap();
        assert!(matches!(late, SeriesLookup::Pending));
        assert!(matches!(cache.peek(&day_key()), SeriesLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn retry_after_switching_back_reports_loading() {
        let source = Arc::new(MockSource::default());
        let cache = Arc::new(HistoricalSeriesCache::new("chart", source.clone()));

        source.fail.store(true, Ordering::SeqCst);
        assert!(cache.get_or_fetch(&live_key()).await.is_stale());

        // Switch to 24H, which loads fine.
        source.fail.store(false, Ordering::SeqCst);
        assert!(matches!(cache.get_or_fetch(&day_key()).await, SeriesLookup::Fresh(_)));

        // Back to LIVE: while the retry is outstanding the lookup is Pending,
        // not Stale with the 24H entry.
        source.gate(&live_key());
        let retry = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_fetch(&live_key()).await })
        };
        wait_for_calls(&source, 3).await;
        assert!(matches!(cache.peek(&live_key()), SeriesLookup::Pending));

        source.open(&live_key());
        assert!(matches!(retry.await.unwrap(), SeriesLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn retry_of_failed_key_reports_loading_while_in_flight() {
        let source = Arc::new(MockSource::default());
        let cache = Arc::new(HistoricalSeriesCache::new("chart", source.clone()));

        source.fail.store(true, Ordering::SeqCst);
        assert!(cache.get_or_fetch(&day_key()).await.is_stale());
        assert!(cache.peek(&day_key()).is_stale());

        source.fail.store(false, Ordering::SeqCst);
        source.gate(&day_key());
        let retry = {
            let cache = cache.clone();
            tokio::spawn(async move { cache.get_or_fetch(&day_key()).await })
        };
        wait_for_calls(&source, 2).await;
        assert!(matches!(cache.peek(&day_key()), SeriesLookup::Pending));

        source.open(&day_key());
        assert!(matches!(retry.await.unwrap(), SeriesLookup::Fresh(_)));
    }

    #[tokio::test]
    async fn success_for_another_key_clears_old_failure() {
        let source = Arc::new(MockSource::default());
        let cache = HistoricalSeriesCache::new("chart", source.clone());

        source.fail.store(true, Ordering::SeqCst);
        cache.get_or_fetch(&live_key()).await;
        source.fail.store(false, Ordering::SeqCst);
        cache.get_or_fetch(&day_key()).await;

        assert!(matches!(cache.peek(&live_key()), SeriesLookup::Pending));
    }

    #[tokio::test]
    async fn ensure_refreshes_only_expired_entries() {
        let cache = HistoricalSeriesCache::new("chart", MockSource::default());
        let key = day_key();
        cache.ensure(&key, Some(Duration::from_secs(3600))).await;
        cache.ensure(&key, Some(Duration::from_secs(3600))).await;
        assert_eq!(cache.fetch_count(), 1);

        cache.ensure(&key, Some(Duration::ZERO)).await;
        assert_eq!(cache.fetch_count(), 2);

        cache.ensure(&key, None).await;
        assert_eq!(cache.fetch_count(), 2);
    }
}
