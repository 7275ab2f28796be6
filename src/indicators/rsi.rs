// =============================================================================
// Relative Strength Index (RSI) — rolling simple means
// =============================================================================
//
// Step 1 — Compute price changes (deltas) from consecutive closes.
// Step 2 — For every window of `period` deltas, average the gains and the
//          losses with a plain arithmetic mean (no Wilder smoothing).
// Step 3 — RS  = avg_gain / avg_loss
//          RSI = 100 - 100 / (1 + RS)
//
// Thresholds:  RSI >= 70 => OVERBOUGHT,  RSI <= 30 => OVERSOLD.
// =============================================================================

/// Compute the rolling RSI series for `closes`.
///
/// The returned vector has one value per close starting at index `period`.
///
/// # Edge cases
/// - `period == 0` => empty vec
/// - `closes.len() < period + 1` => empty vec (need at least `period` deltas)
/// - No down moves in a window => 100.0; no movement at all => 50.0.
/// - Non-finite results end the series.
pub fn calculate_rsi(closes: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || closes.len() < period + 1 {
        return Vec::new();
    }

    let deltas: Vec<f64> = closes.windows(2).map(|w| w[1] - w[0]).collect();
    let period_f = period as f64;

    let mut result = Vec::with_capacity(deltas.len() - period + 1);
    for window in deltas.windows(period) {
        let (gain, loss) = window.iter().fold((0.0_f64, 0.0_f64), |(g, l), &d| {
            if d > 0.0 {
                (g + d, l)
            } else {
                (g, l - d)
            }
        });
        match rsi_from_averages(gain / period_f, loss / period_f) {
            Some(rsi) => result.push(rsi),
            None => break,
        }
    }

    result
}

/// Most recent RSI value together with a human-readable label.
pub fn current_rsi(closes: &[f64], period: usize) -> Option<(f64, &'static str)> {
    let value = *calculate_rsi(closes, period).last()?;
    Some((value, rsi_zone(value)))
}

/// Zone label for an RSI value; both thresholds are inclusive.
pub fn rsi_zone(value: f64) -> &'static str {
    if value >= 70.0 {
        "OVERBOUGHT"
    } else if value <= 30.0 {
        "OVERSOLD"
    } else {
        "NEUTRAL"
    }
}

/// Convert average gain / average loss into an RSI value in [0, 100].
fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> Option<f64> {
    let rsi = if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    };

    rsi.is_finite().then_some(rsi)
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rsi_empty_input() {
        assert!(calculate_rsi(&[], 14).is_empty());
    }

    #[test]
    fn rsi_period_zero() {
        assert!(calculate_rsi(&[1.0, 2.0, 3.0], 0).is_empty());
    }

    #[test]
    fn rsi_insufficient_data() {
        // 14 closes => 13 deltas < 14.
        assert!(calculate_rsi(&(1..=14).map(|x| x as f64).collect::<Vec<_>>(), 14).is_empty());
    }

    #[test]
    fn rsi_series_length() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        assert_eq!(calculate_rsi(&closes, 14).len(), 30 - 14);
    }

    #[test]
    fn rsi_all_gains() {
        let closes: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!((v - 100.0).abs() < 1e-10, "expected 100.0, got {v}");
        }
    }

    #[test]
    fn rsi_all_losses() {
        let closes: Vec<f64> = (1..=30).rev().map(|x| x as f64).collect();
        for v in calculate_rsi(&closes, 14) {
            assert!(v.abs() < 1e-10, "expected 0.0, got {v}");
        }
    }

    #[test]
    fn rsi_flat_market() {
        for v in calculate_rsi(&[100.0; 30], 14) {
            assert!((v - 50.0).abs() < 1e-10, "expected 50.0, got {v}");
        }
    }

    #[test]
    fn rsi_uses_plain_window_means() {
        // Window of 2 deltas: +2, -1 => gain 1.0, loss 0.5 => RS 2 => 66.67
        let rsi = calculate_rsi(&[10.0, 12.0, 11.0], 2);
        assert_eq!(rsi.len(), 1);
        assert!((rsi[0] - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn rsi_range_check() {
        let closes = vec![
            44.34, 44.09, 44.15, 43.61, 44.33, 44.83, 45.10, 45.42, 45.84, 46.08,
            45.89, 46.03, 44.18, 44.22, 44.57, 43.42, 42.66, 43.13,
        ];
        for v in calculate_rsi(&closes, 14) {
            assert!((0.0..=100.0).contains(&v), "RSI {v} out of range");
        }
    }

    #[test]
    fn current_rsi_labels() {
        let up: Vec<f64> = (1..=30).map(|x| x as f64).collect();
        let down: Vec<f64> = up.iter().rev().copied().collect();
        assert_eq!(current_rsi(&up, 14).unwrap().1, "OVERBOUGHT");
        assert_eq!(current_rsi(&down, 14).unwrap().1, "OVERSOLD");
        assert_eq!(current_rsi(&[100.0; 30], 14).unwrap().1, "NEUTRAL");
        assert!(current_rsi(&[], 14).is_none());
    }

    #[test]
    fn zone_thresholds_are_inclusive() {
        assert_eq!(rsi_zone(70.0), "OVERBOUGHT");
        assert_eq!(rsi_zone(69.99), "NEUTRAL");
        assert_eq!(rsi_zone(30.0), "OVERSOLD");
        assert_eq!(rsi_zone(30.01), "NEUTRAL");
    }
}
