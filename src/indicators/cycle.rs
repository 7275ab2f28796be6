// =============================================================================
// Cycle Indicators — long-horizon "where are we in the cycle" gauges
// =============================================================================
//
// Computed from the daily series of the analysis instrument:
//
//   Pi cycle       111DMA vs 2 × 350DMA; ratio = close / (2 × 350DMA)
//   Puell-style    multiple = close / 365DMA
//                  meter    = clamp((multiple - 0.5) / (3.0 - 0.5), 0, 1) × 100
//   RSI(14)        rolling simple means
//   Top score      min(100, (ratio × 0.6 + RSI / 100 × 0.4) × 100)
//   Valuation      clamp((close / 200DMA - 0.5) / 1.9, 0, 1) × 100
//   Rainbow        100DMA base line; bands are the base × RAINBOW_BANDS
//
// Fewer than 350 daily candles => not available.
// =============================================================================

use serde::Serialize;

use super::rsi::current_rsi;
use super::sma::{last_sma, rolling_sma};
use crate::market_data::candle::CandleSeries;

pub const MIN_CANDLES: usize = 350;

const RSI_PERIOD: usize = 14;
const PUELL_LOW: f64 = 0.5;
const PUELL_HIGH: f64 = 3.0;
const RAINBOW_PERIOD: usize = 100;

/// Multipliers applied to `rainbow_base`, cheapest band first.
pub const RAINBOW_BANDS: [f64; 6] = [0.5, 0.75, 1.0, 1.25, 1.5, 1.75];

/// Coarse reading of the valuation score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Valuation above 80: overheated.
    TopHeavy,
    Neutral,
    /// Valuation below 20: accumulation zone.
    Bottom,
}

impl CycleStatus {
    fn from_valuation(score: f64) -> Self {
        if score > 80.0 {
            Self::TopHeavy
        } else if score < 20.0 {
            Self::Bottom
        } else {
            Self::Neutral
        }
    }
}

/// Chart lines aligned with the daily candles.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleLines {
    pub open_times: Vec<i64>,
    pub dma_111: Vec<Option<f64>>,
    pub dma_350x2: Vec<Option<f64>>,
    pub puell: Vec<Option<f64>>,
    pub rainbow_base: Vec<Option<f64>>,
    pub rainbow_bands: [f64; 6],
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleIndicators {
    pub last_close: f64,
    pub dma_111: f64,
    pub dma_350x2: f64,
    pub pi_ratio: f64,
    /// `None` with fewer than 365 candles.
    pub puell_multiple: Option<f64>,
    pub puell_meter: Option<f64>,
    pub rsi_14: Option<f64>,
    /// OVERBOUGHT / OVERSOLD / NEUTRAL.
    pub rsi_zone: Option<&'static str>,
    pub top_score: Option<f64>,
    pub valuation_score: f64,
    pub status: CycleStatus,
    pub lines: CycleLines,
}

impl CycleIndicators {
    pub fn compute(series: &CandleSeries) -> Option<Self> {
        if series.len() < MIN_CANDLES {
            return None;
        }
        let closes = series.closes();
        let last_close = *closes.last()?;

        let dma_111 = last_sma(&closes, 111)?;
        let dma_350x2 = last_sma(&closes, 350)? * 2.0;
        if dma_350x2 <= 0.0 {
            return None;
        }
        let pi_ratio = last_close / dma_350x2;

        let puell_multiple = last_sma(&closes, 365)
            .filter(|dma| *dma > 0.0)
            .map(|dma| last_close / dma);
        let puell_meter = puell_multiple.map(|m| {
            ((m - PUELL_LOW) / (PUELL_HIGH - PUELL_LOW) * 100.0).clamp(0.0, 100.0)
        });

        let rsi = current_rsi(&closes, RSI_PERIOD);
        let rsi_14 = rsi.map(|(value, _)| value);
        let rsi_zone = rsi.map(|(_, zone)| zone);
        let top_score = rsi_14.map(|rsi| ((pi_ratio * 0.6 + rsi / 100.0 * 0.4) * 100.0).min(100.0));

        let valuation_score = match last_sma(&closes, 200) {
            Some(dma) if dma > 0.0 => ((last_close / dma - 0.5) / 1.9 * 100.0).clamp(0.0, 100.0),
            _ => 50.0,
        };

        let dma_365 = rolling_sma(&closes, 365);
        let lines = CycleLines {
            open_times: series.candles().iter().map(|c| c.open_time).collect(),
            dma_111: rolling_sma(&closes, 111),
            dma_350x2: rolling_sma(&closes, 350)
                .into_iter()
                .map(|v| v.map(|v| v * 2.0))
                .collect(),
            puell: closes
                .iter()
                .zip(dma_365)
                .map(|(close, dma)| dma.filter(|d| *d > 0.0).map(|d| close / d))
                .collect(),
            rainbow_base: rolling_sma(&closes, RAINBOW_PERIOD),
            rainbow_bands: RAINBOW_BANDS,
        };

        Some(Self {
            last_close,
            dma_111,
            dma_350x2,
            pi_ratio,
            puell_multiple,
            puell_meter,
            rsi_14,
            rsi_zone,
            top_score,
            valuation_score,
            status: CycleStatus::from_valuation(valuation_score),
            lines,
        })
    }
}
