// =============================================================================
// Periodic Refresh Scheduler — FAST and SLOW ticks
// =============================================================================
//
//   FAST  live overlay + chart redraw. Period follows the selected timeframe
//         (LIVE 2 s, coarser 60 s) and is re-armed the moment the selection
//         changes. Never triggers network I/O.
//   SLOW  aggregate tickers, market table, cache fill / retry (~10 s).
//
// Ticks carry no state. The channel is bounded; when the consumer lags, new
// ticks are dropped instead of queued.
// =============================================================================

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, Interval, MissedTickBehavior};
use tracing::{debug, info};

use crate::runtime_config::RefreshParams;
use crate::types::Timeframe;

/// Queue depth of the tick channel.
pub const TICK_BUFFER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Fast,
    Slow,
}

pub struct RefreshScheduler {
    params: RefreshParams,
    timeframe: watch::Receiver<Timeframe>,
    ticks: mpsc::Sender<Tick>,
}

fn skipping(mut timer: Interval) -> Interval {
    timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
    timer
}

impl RefreshScheduler {
    pub fn new(
        params: RefreshParams,
        timeframe: watch::Receiver<Timeframe>,
        ticks: mpsc::Sender<Tick>,
    ) -> Self {
        Self {
            params,
            timeframe,
            ticks,
        }
    }

    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Returns `false` once the consumer is gone.
    fn emit(&self, tick: Tick) -> bool {
        match self.ticks.try_send(tick) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                debug!(?tick, "consumer busy — tick dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut current = *self.timeframe.borrow_and_update();
        let mut fast = skipping(interval(self.params.fast_period(current)));
        let mut slow = skipping(interval(self.params.slow_period()));

        info!(
            fast_ms = self.params.fast_period(current).as_millis() as u64,
            slow_secs = self.params.slow_period().as_secs(),
            "refresh scheduler started"
        );

        loop {
            tokio::select! {
                _ = fast.tick() => {
                    if !self.emit(Tick::Fast) {
                        break;
                    }
                }
                _ = slow.tick() => {
                    if !self.emit(Tick::Slow) {
                        break;
                    }
                }
                changed = self.timeframe.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let next = *self.timeframe.borrow_and_update();
                    if next != current {
                        let period = self.params.fast_period(next);
                        debug!(timeframe = %next, period_ms = period.as_millis() as u64, "fast tick re-armed");
                        current = next;
                        // First tick of a fresh interval fires immediately.
                        fast = skipping(interval(period));
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("refresh scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn params() -> RefreshParams {
        RefreshParams {
            live_tick_ms: 20,
            coarse_tick_ms: 60_000,
            slow_tick_secs: 60,
        }
    }

    async fn count_for(rx: &mut mpsc::Receiver<Tick>, window: Duration) -> (usize, usize) {
        let (mut fast, mut slow) = (0, 0);
        let deadline = tokio::time::Instant::now() + window;
        while let Ok(Some(tick)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            match tick {
                Tick::Fast => fast += 1,
                Tick::Slow => slow += 1,
            }
        }
        (fast, slow)
    }

    #[tokio::test]
    async fn live_ticks_fast_and_slow_fires_once() {
        let (tf_tx, tf_rx) = watch::channel(Timeframe::Live);
        let (tx, mut rx) = mpsc::channel(64);
        let (_stop_tx, stop_rx) = watch::channel(false);
        let handle = RefreshScheduler::new(params(), tf_rx, tx).spawn(stop_rx);

        let (fast, slow) = count_for(&mut rx, Duration::from_millis(300)).await;
        assert!(fast >= 5, "expected many fast ticks, got {fast}");
        assert_eq!(slow, 1);

        drop(tf_tx);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn switching_to_coarse_timeframe_slows_fast_tick() {
        let (tf_tx, tf_rx) = watch::channel(Timeframe::Live);
        let (tx, mut rx) = mpsc::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = RefreshScheduler::new(params(), tf_rx, tx).spawn(stop_rx);

        count_for(&mut rx, Duration::from_millis(100)).await;
        tf_tx.send(Timeframe::Year).unwrap();

        // The re-armed interval fires once immediately, then stays quiet. A
        // live tick racing the switch may still land.
        let (fast, _) = count_for(&mut rx, Duration::from_millis(300)).await;
        assert!((1..=2).contains(&fast), "got {fast} fast ticks");

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn full_channel_drops_ticks() {
        let (_tf_tx, tf_rx) = watch::channel(Timeframe::Live);
        let (tx, mut rx) = mpsc::channel(TICK_BUFFER);
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = RefreshScheduler::new(params(), tf_rx, tx).spawn(stop_rx);

        tokio::time::sleep(Duration::from_millis(300)).await;
        let mut queued = 0;
        while rx.try_recv().is_ok() {
            queued += 1;
        }
        assert!(queued <= TICK_BUFFER);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
