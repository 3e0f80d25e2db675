//! Reconciliation of stored candles against the exchange.
//!
//! `StartupSync` runs once before live ingestion; `GapWatchdog` repeats the
//! same boundary check on a fixed interval. Both take the symbol universe
//! from the base timeframe table and hand every lagging range to the
//! backfill engine. `StartupSync` then rebuilds the trailing window of every
//! derived timeframe from the stored base rows.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backfill::BackfillEngine;
use crate::config::{TimeframePlan, WatchdogConfig};
use crate::errors::Result;
use crate::rebuild::CandleRebuilder;
use crate::timeframe::Timeframe;

/// Range to backfill when the newest stored bucket `last_open` lags the
/// expected boundary. `None` when storage is current.
pub fn gap_range(last_open: i64, duration_ms: i64, expected: i64) -> Option<(i64, i64)> {
    (last_open < expected).then_some((last_open + duration_ms, expected))
}

/// Totals from one reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub symbols: usize,
    /// Ranges that lagged the expected boundary
    pub gaps: usize,
    pub candles: usize,
    /// Symbol/timeframe pairs whose check or backfill failed
    pub failures: usize,
    /// Derived candles rebuilt from base rows
    pub rebuilt: usize,
}

/// One-shot sync run at boot.
pub struct StartupSync {
    backfill: Arc<BackfillEngine>,
    rebuilder: CandleRebuilder,
    plan: TimeframePlan,
    cancel: CancellationToken,
}

impl StartupSync {
    pub fn new(backfill: Arc<BackfillEngine>, plan: TimeframePlan, cancel: CancellationToken) -> Self {
        Self {
            rebuilder: CandleRebuilder::new(backfill.store().clone(), plan.base),
            backfill,
            plan,
            cancel,
        }
    }

    /// Bring every REST-synced timeframe up to its last closed bucket.
    ///
    /// The base timeframe resumes forward from its newest row. Other
    /// timeframes are filled backward, from the start of history when the
    /// symbol has no rows yet. Finally the newest complete window of each
    /// derived timeframe is rebuilt from the base rows.
    pub async fn run(&self) -> Result<PassSummary> {
        info!("Startup sync started");

        let now = self.backfill.history().server_time().await?;
        let store = self.backfill.store();
        let base = self.plan.base;
        let symbols = store.distinct_symbols(base).await?;

        let mut summary = PassSummary {
            symbols: symbols.len(),
            ..PassSummary::default()
        };

        for tf in self.plan.rest_synced() {
            let expected = tf.expected_last_closed(now);

            for symbol in &symbols {
                if self.cancel.is_cancelled() {
                    info!("Startup sync interrupted by shutdown");
                    return Ok(summary);
                }

                let latest = match store.latest_open_time(symbol, tf).await {
                    Ok(latest) => latest,
                    Err(e) => {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "Failed to read latest candle");
                        summary.failures += 1;
                        continue;
                    }
                };

                let range = match latest {
                    Some(last) => gap_range(last, tf.duration_ms(), expected),
                    None if tf == base => None,
                    None => Some((0, expected)),
                };
                let Some((start, end)) = range else {
                    debug!(symbol = %symbol, timeframe = %tf, "Up to date");
                    continue;
                };

                summary.gaps += 1;
                info!(symbol = %symbol, timeframe = %tf, start, end, "Startup gap detected");

                let result = if tf == base {
                    self.backfill.catch_up(symbol, tf, start, end).await
                } else {
                    self.backfill.backfill(symbol, tf, start, end).await
                };

                match result {
                    Ok(report) => summary.candles += report.candles,
                    Err(e) => {
                        error!(symbol = %symbol, timeframe = %tf, error = %e, "Startup backfill failed");
                        summary.failures += 1;
                    }
                }
            }
        }

        for symbol in &symbols {
            if self.cancel.is_cancelled() {
                info!("Startup sync interrupted by shutdown");
                return Ok(summary);
            }
            self.rebuild_trailing(symbol, &mut summary).await;
        }

        info!(
            symbols = summary.symbols,
            gaps = summary.gaps,
            candles = summary.candles,
            rebuilt = summary.rebuilt,
            failures = summary.failures,
            "Startup sync completed"
        );
        Ok(summary)
    }

    async fn rebuild_trailing(&self, symbol: &str, summary: &mut PassSummary) {
        let last_base = match self.backfill.store().latest_open_time(symbol, self.plan.base).await {
            Ok(Some(last)) => last,
            Ok(None) => return,
            Err(e) => {
                warn!(symbol, error = %e, "Failed to read latest base candle");
                summary.failures += 1;
                return;
            }
        };

        for &tf in &self.plan.derived {
            let window = self.rebuilder.trailing_window(tf, last_base);
            match self.rebuilder.rebuild(symbol, tf, window).await {
                Ok(true) => summary.rebuilt += 1,
                Ok(false) => debug!(symbol, timeframe = %tf, window, "Trailing window incomplete"),
                Err(e) => {
                    warn!(symbol, timeframe = %tf, error = %e, "Failed to rebuild derived candle");
                    summary.failures += 1;
                }
            }
        }
    }
}

/// Periodic lag check for symbols already in the base table.
pub struct GapWatchdog {
    backfill: Arc<BackfillEngine>,
    base: Timeframe,
    timeframes: Vec<Timeframe>,
    interval: Duration,
    grace: Duration,
    gaps_detected: AtomicU64,
}

impl GapWatchdog {
    pub fn new(backfill: Arc<BackfillEngine>, plan: &TimeframePlan, config: &WatchdogConfig) -> Self {
        Self {
            backfill,
            base: plan.base,
            timeframes: plan.rest_synced(),
            interval: config.interval,
            grace: config.grace,
            gaps_detected: AtomicU64::new(0),
        }
    }

    /// Total gaps found since start.
    pub fn gaps_detected(&self) -> u64 {
        self.gaps_detected.load(Ordering::Relaxed)
    }

    /// Run until cancelled. The first check happens one interval after start.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(interval = ?self.interval, grace = ?self.grace, "Gap watchdog started");

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once(&cancel).await {
                        warn!(error = %e, "Gap watchdog pass skipped");
                    }
                }
            }
        }

        info!("Gap watchdog stopped");
    }

    /// One pass over every REST-synced timeframe.
    pub async fn check_once(&self, cancel: &CancellationToken) -> Result<PassSummary> {
        let now = self.backfill.history().server_time().await? - self.grace.as_millis() as i64;
        let store = self.backfill.store();
        let symbols = store.distinct_symbols(self.base).await?;

        let mut summary = PassSummary {
            symbols: symbols.len(),
            ..PassSummary::default()
        };

        for &tf in &self.timeframes {
            let expected = tf.expected_last_closed(now);
            debug!(timeframe = %tf, expected, "Checking timeframe");

            for symbol in &symbols {
                if cancel.is_cancelled() {
                    return Ok(summary);
                }

                let last_open = match store.latest_open_time(symbol, tf).await {
                    Ok(Some(last)) => last,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(symbol = %symbol, timeframe = %tf, error = %e, "Failed to read latest candle");
                        summary.failures += 1;
                        continue;
                    }
                };

                let Some((start, end)) = gap_range(last_open, tf.duration_ms(), expected) else {
                    continue;
                };

                summary.gaps += 1;
                self.gaps_detected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    symbol = %symbol,
                    timeframe = %tf,
                    last_open,
                    expected,
                    "Gap detected"
                );

                match self.backfill.backfill(symbol, tf, start, end).await {
                    Ok(report) => summary.candles += report.candles,
                    Err(e) => {
                        error!(symbol = %symbol, timeframe = %tf, error = %e, "Gap backfill failed");
                        summary.failures += 1;
                    }
                }
            }
        }

        if summary.gaps > 0 {
            info!(
                gaps = summary.gaps,
                candles = summary.candles,
                failures = summary.failures,
                "Gap watchdog pass done"
            );
        }
        Ok(summary)
    }
}
