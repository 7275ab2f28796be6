// =============================================================================
// Control State Store — the user's current selection
// =============================================================================
//
// Owned by the dashboard actor; mutated only by control commands arriving
// from the API. Holds the chart instrument, the timeframe (exactly one active
// button), the market-table page cursor and the analysis instrument.
//
// Timeframe state machine: {LIVE, 24H, 7D, 1M, 1Y, 5Y}, initial LIVE,
// transitions only by explicit selection, no terminal state.
// =============================================================================

use std::collections::HashSet;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, info};

use crate::types::{SeriesKey, Timeframe};

/// Daily series fetched for the cycle indicators.
pub const ANALYSIS_INTERVAL: &str = "1d";
/// Candles requested for the cycle indicators (the endpoint's maximum).
pub const ANALYSIS_LIMIT: u32 = 1000;

/// Current user selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// 1-based market-table page.
    pub page: usize,
    pub analysis_symbol: String,
}

impl Selection {
    /// Cache key of the chart series for this selection.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey::for_timeframe(&self.symbol, self.timeframe)
    }

    pub fn analysis_key(&self) -> SeriesKey {
        SeriesKey::new(&self.analysis_symbol, ANALYSIS_INTERVAL, ANALYSIS_LIMIT)
    }
}

/// A user interaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "value", rename_all = "snake_case")]
pub enum ControlCommand {
    SelectInstrument(String),
    SelectTimeframe(Timeframe),
    SelectAnalysis(String),
    NextPage,
    PrevPage,
}

/// A command plus the channel its outcome is reported on.
#[derive(Debug)]
pub struct ControlRequest {
    pub command: ControlCommand,
    pub reply: oneshot::Sender<std::result::Result<Selection, String>>,
}

/// Pager state as shown under the market table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Pagination {
    pub page: usize,
    pub page_count: usize,
    pub prev_enabled: bool,
    pub next_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeframeButton {
    pub timeframe: Timeframe,
    pub active: bool,
}

pub struct ControlStateStore {
    selection: Selection,
    tracked: HashSet<String>,
    page_count: usize,
}

impl ControlStateStore {
    pub fn new<I, S>(default_symbol: &str, tracked: I, page_count: usize) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            selection: Selection {
                symbol: default_symbol.to_string(),
                timeframe: Timeframe::default(),
                page: 1,
                analysis_symbol: default_symbol.to_string(),
            },
            tracked: tracked.into_iter().map(Into::into).collect(),
            page_count: page_count.max(1),
        }
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    fn ensure_tracked(&self, symbol: &str) -> Result<()> {
        if !self.tracked.contains(symbol) {
            anyhow::bail!("instrument {symbol} is not tracked");
        }
        Ok(())
    }

    /// Returns whether the selection changed. Untracked symbols are rejected
    /// and leave the state untouched.
    pub fn select_instrument(&mut self, symbol: &str) -> Result<bool> {
        self.ensure_tracked(symbol)?;
        if self.selection.symbol == symbol {
            return Ok(false);
        }
        info!(from = %self.selection.symbol, to = %symbol, "chart instrument selected");
        self.selection.symbol = symbol.to_string();
        Ok(true)
    }

    pub fn select_analysis(&mut self, symbol: &str) -> Result<bool> {
        self.ensure_tracked(symbol)?;
        if self.selection.analysis_symbol == symbol {
            return Ok(false);
        }
        info!(to = %symbol, "analysis instrument selected");
        self.selection.analysis_symbol = symbol.to_string();
        Ok(true)
    }

    pub fn select_timeframe(&mut self, timeframe: Timeframe) -> bool {
        if self.selection.timeframe == timeframe {
            return false;
        }
        info!(from = %self.selection.timeframe, to = %timeframe, "timeframe selected");
        self.selection.timeframe = timeframe;
        true
    }

    /// No-op on the last page.
    pub fn next_page(&mut self) -> bool {
        if self.selection.page >= self.page_count {
            debug!(page = self.selection.page, "already on last page");
            return false;
        }
        self.selection.page += 1;
        true
    }

    /// No-op on the first page.
    pub fn prev_page(&mut self) -> bool {
        if self.selection.page <= 1 {
            debug!("already on first page");
            return false;
        }
        self.selection.page -= 1;
        true
    }

    pub fn pagination(&self) -> Pagination {
        Pagination {
            page: self.selection.page,
            page_count: self.page_count,
            prev_enabled: self.selection.page > 1,
            next_enabled: self.selection.page < self.page_count,
        }
    }

    pub fn timeframe_buttons(&self) -> Vec<TimeframeButton> {
        Timeframe::ALL
            .iter()
            .map(|&timeframe| TimeframeButton {
                timeframe,
                active: timeframe == self.selection.timeframe,
            })
            .collect()
    }

    pub fn apply(&mut self, command: &ControlCommand) -> Result<bool> {
        match command {
            ControlCommand::SelectInstrument(symbol) => self.select_instrument(symbol),
            ControlCommand::SelectTimeframe(tf) => Ok(self.select_timeframe(*tf)),
            ControlCommand::SelectAnalysis(symbol) => self.select_analysis(symbol),
            ControlCommand::NextPage => Ok(self.next_page()),
            ControlCommand::PrevPage => Ok(self.prev_page()),
        }
    }
}

impl std::fmt::Debug for ControlStateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlStateStore")
            .field("selection", &self.selection)
            .field("tracked", &self.tracked.len())
            .field("page_count", &self.page_count)
            .finish()
    }
}
