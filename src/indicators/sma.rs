// =============================================================================
// Simple Moving Average (SMA)
// =============================================================================
//
// SMA_t = mean(close_{t-period+1} ..= close_t)
//
// `rolling_sma` keeps the output aligned with its input: the first
// `period - 1` slots are `None`, so the line can be drawn over the same
// x-axis as the candles.
// =============================================================================

/// Rolling mean aligned with `values`. `period == 0` yields all `None`.
pub fn rolling_sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut out = vec![None; values.len()];
    if period == 0 || values.len() < period {
        return out;
    }

    let period_f = period as f64;
    let mut sum: f64 = values[..period].iter().sum();
    out[period - 1] = Some(sum / period_f).filter(|v| v.is_finite());
    for i in period..values.len() {
        sum += values[i] - values[i - period];
        out[i] = Some(sum / period_f).filter(|v| v.is_finite());
    }
    out
}

/// Mean of the last `period` values, or `None` with too little data.
pub fn last_sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    let mean = values[values.len() - period..].iter().sum::<f64>() / period as f64;
    mean.is_finite().then_some(mean)
}
