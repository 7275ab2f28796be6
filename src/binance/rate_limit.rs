// =============================================================================
// Rate-Limit Tracker — monitors Binance request weight to avoid 429s
// =============================================================================
//
// Binance allows 1200 request weight per minute per IP; we hard-cap ourselves
// at 1000. The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after
// every request. The counter is tagged with the minute it was reported in, so
// a new minute starts from zero without a reset timer.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// `X-MBX-USED-WEIGHT-1M`, lowercased for `HeaderName::from_static`.
pub const WEIGHT_HEADER: &str = "x-mbx-used-weight-1m";

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 1000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 800;

fn current_minute() -> i64 {
    Utc::now().timestamp() / 60
}

/// Thread-safe request-weight tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    minute: AtomicI64,
    refused: AtomicU32,
}

/// Serialisable snapshot for the health endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub hard_limit: u32,
    pub refused_requests: u32,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            minute: AtomicI64::new(current_minute()),
            refused: AtomicU32::new(0),
        }
    }

    /// Update the weight counter from the response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get(WEIGHT_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u32>().ok())
        else {
            return;
        };
        self.record_weight(w, current_minute());
    }

    fn record_weight(&self, w: u32, minute: i64) {
        let prev = self.weight_at(minute);
        self.used_weight_1m.store(w, Ordering::Relaxed);
        self.minute.store(minute, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(
                used_weight = w,
                hard_limit = WEIGHT_HARD_LIMIT,
                "rate-limit weight crossed warning threshold"
            );
        }
        debug!(used_weight_1m = w, "rate-limit weight updated from header");
    }

    fn weight_at(&self, minute: i64) -> u32 {
        if self.minute.load(Ordering::Relaxed) == minute {
            self.used_weight_1m.load(Ordering::Relaxed)
        } else {
            0
        }
    }

    /// Weight used in the current minute.
    pub fn used_weight(&self) -> u32 {
        self.weight_at(current_minute())
    }

    /// Return `true` if we can afford to spend `weight` more request weight
    /// without exceeding the hard limit.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight();
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            self.refused.fetch_add(1, Ordering::Relaxed);
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
        }
        allowed
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight(),
            hard_limit: WEIGHT_HARD_LIMIT,
            refused_requests: self.refused.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("used_weight_1m", &self.used_weight())
            .field("refused", &self.refused.load(Ordering::Relaxed))
            .finish()
    }
}
