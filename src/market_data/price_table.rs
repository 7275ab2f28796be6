// =============================================================================
// Latest Price Table — lock-free latest trade price per tracked instrument
// =============================================================================
//
// The key set is fixed when the table is built and every key is pre-seeded,
// so a lookup for a tracked instrument never fails. Each slot stores the f64
// bit pattern in an AtomicU64: a reader always sees a complete value that was
// written at some point, and never blocks the (single) writer.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Sentinel stored in `updated_ms` while a slot still holds its seed value.
const NEVER_UPDATED: i64 = i64::MIN;

struct PriceSlot {
    bits: AtomicU64,
    updated_ms: AtomicI64,
}

impl PriceSlot {
    fn seeded(price: f64) -> Self {
        Self {
            bits: AtomicU64::new(price.to_bits()),
            updated_ms: AtomicI64::new(NEVER_UPDATED),
        }
    }
}

/// Point-in-time read of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceQuote {
    pub price: f64,
    /// `None` while the slot still holds its seed value.
    pub updated_at: Option<DateTime<Utc>>,
}

impl PriceQuote {
    /// Whether the price came from the feed rather than the seed.
    pub fn is_live(&self) -> bool {
        self.updated_at.is_some()
    }
}

/// Shared store of the most recent price per instrument.
pub struct LatestPriceTable {
    slots: HashMap<String, PriceSlot>,
    updates: AtomicU64,
}

impl LatestPriceTable {
    /// Build a table tracking `symbols`, every slot seeded with `seed`.
    pub fn new<I, S>(symbols: I, seed: f64) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::with_seeds(symbols.into_iter().map(|s| (s, seed)))
    }

    /// Build a table from explicit `(symbol, seed)` pairs.
    pub fn with_seeds<I, S>(seeds: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let slots = seeds
            .into_iter()
            .map(|(symbol, seed)| (symbol.into(), PriceSlot::seeded(seed)))
            .collect();
        Self {
            slots,
            updates: AtomicU64::new(0),
        }
    }

    /// Replace the price for `symbol`. Returns `false` (and does nothing) for
    /// untracked symbols.
    pub fn set(&self, symbol: &str, price: f64) -> bool {
        let Some(slot) = self.slots.get(symbol) else {
            return false;
        };
        slot.bits.store(price.to_bits(), Ordering::Release);
        slot.updated_ms
            .store(Utc::now().timestamp_millis(), Ordering::Release);
        self.updates.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Latest price, or `None` if `symbol` is not tracked.
    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.slots
            .get(symbol)
            .map(|slot| f64::from_bits(slot.bits.load(Ordering::Acquire)))
    }

    /// Latest price together with the time of the last feed update.
    pub fn quote(&self, symbol: &str) -> Option<PriceQuote> {
        let slot = self.slots.get(symbol)?;
        let price = f64::from_bits(slot.bits.load(Ordering::Acquire));
        let updated_ms = slot.updated_ms.load(Ordering::Acquire);
        let updated_at = if updated_ms == NEVER_UPDATED {
            None
        } else {
            Utc.timestamp_millis_opt(updated_ms).single()
        };
        Some(PriceQuote { price, updated_at })
    }

    pub fn is_tracked(&self, symbol: &str) -> bool {
        self.slots.contains_key(symbol)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.slots.keys().map(String::as_str)
    }

    /// Total number of accepted writes since startup.
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// Quotes for every tracked symbol, sorted by symbol.
    pub fn snapshot(&self) -> Vec<(String, PriceQuote)> {
        let mut out: Vec<(String, PriceQuote)> = self
            .slots
            .keys()
            .filter_map(|s| self.quote(s).map(|q| (s.clone(), q)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

impl std::fmt::Debug for LatestPriceTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatestPriceTable")
            .field("tracked", &self.slots.len())
            .field("updates", &self.update_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn seeded_lookup_never_fails() {
        let table = LatestPriceTable::new(["BTCUSDT", "ETHUSDT"], 0.0);
        let quote = table.quote("BTCUSDT").expect("tracked");
        assert_eq!(quote.price, 0.0);
        assert!(!quote.is_live());
        assert_eq!(table.price("ETHUSDT"), Some(0.0));
    }

    #[test]
    fn write_replaces_value_and_marks_live() {
        let table = LatestPriceTable::with_seeds([("BTCUSDT", 1.0)]);
        assert!(table.set("BTCUSDT", 5_000_000.0));
        let quote = table.quote("BTCUSDT").unwrap();
        assert_eq!(quote.price, 5_000_000.0);
        assert!(quote.is_live());
        assert_eq!(table.update_count(), 1);
    }

    #[test]
    fn untracked_symbols_are_ignored() {
        let table = LatestPriceTable::new(["BTCUSDT"], 0.0);
        assert!(!table.set("PEPEUSDT", 1.0));
        assert_eq!(table.price("PEPEUSDT"), None);
        assert_eq!(table.update_count(), 0);
        assert!(!table.is_tracked("PEPEUSDT"));
    }

    #[test]
    fn last_write_wins() {
        let table = LatestPriceTable::new(["BTCUSDT"], 0.0);
        for p in [1.0, 2.0, 3.0] {
            table.set("BTCUSDT", p);
        }
        assert_eq!(table.price("BTCUSDT"), Some(3.0));
    }

    #[test]
    fn readers_only_see_written_values() {
        let table = Arc::new(LatestPriceTable::new(["BTCUSDT"], 1.0));
        let writer = {
            let table = table.clone();
            std::thread::spawn(move || {
                for i in 0..10_000 {
                    table.set("BTCUSDT", if i % 2 == 0 { 2.0 } else { 3.0 });
                }
            })
        };
        for _ in 0..10_000 {
            let p = table.price("BTCUSDT").unwrap();
            assert!(p == 1.0 || p == 2.0 || p == 3.0, "torn read: {p}");
        }
        writer.join().unwrap();
    }

    #[test]
    fn snapshot_is_sorted() {
        let table = LatestPriceTable::new(["SOLUSDT", "BTCUSDT", "ETHUSDT"], 0.0);
        let symbols: Vec<String> = table.snapshot().into_iter().map(|(s, _)| s).collect();
        assert_eq!(symbols, vec!["BTCUSDT", "ETHUSDT", "SOLUSDT"]);
    }
}
