//! One-off bulk backfill across a symbol universe.
//!
//! Every symbol gets the same target: the newest `count` buckets up to the
//! last closed one. Symbols take turns, one backward page each per round,
//! so a long history on one symbol does not hold up the others. A symbol
//! drops out of the rotation once its page loop stops, for any reason.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::backfill::{BackfillEngine, BackfillReport, Step, StopReason};
use crate::errors::{BackfillError, FetchError};
use crate::timeframe::Timeframe;

/// How one symbol's bulk run ended.
#[derive(Debug)]
pub struct SymbolOutcome {
    pub symbol: String,
    pub result: Result<BackfillReport, BackfillError>,
}

struct Progress {
    symbol: String,
    /// `None` once the symbol is out of the rotation
    cursor_end: Option<i64>,
    report: BackfillReport,
    error: Option<BackfillError>,
}

impl Progress {
    fn into_outcome(self) -> SymbolOutcome {
        SymbolOutcome {
            symbol: self.symbol,
            result: match self.error {
                Some(e) => Err(e),
                None => Ok(self.report),
            },
        }
    }
}

pub struct BulkBackfill {
    engine: Arc<BackfillEngine>,
}

impl BulkBackfill {
    pub fn new(engine: Arc<BackfillEngine>) -> Self {
        Self { engine }
    }

    /// Open times `[start, end]` covering the newest `count` closed buckets
    /// at `now_ms`. `None` for a zero count.
    pub fn target_range(timeframe: Timeframe, now_ms: i64, count: usize) -> Option<(i64, i64)> {
        if count == 0 {
            return None;
        }
        let end = timeframe.expected_last_closed(now_ms);
        let start = end - (count as i64 - 1) * timeframe.duration_ms();
        Some((start.max(0), end))
    }

    /// Page every symbol back to its target, round-robin. Returns one
    /// outcome per symbol, in input order.
    pub async fn run(
        &self,
        symbols: &[String],
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<SymbolOutcome>, FetchError> {
        let now = self.engine.history().server_time().await?;
        let range = Self::target_range(timeframe, now, count);

        let mut progress: Vec<Progress> = symbols
            .iter()
            .map(|symbol| Progress {
                symbol: symbol.clone(),
                cursor_end: range.map(|(_, end)| end),
                report: BackfillReport::new(),
                error: None,
            })
            .collect();

        let Some((start, end)) = range else {
            info!(timeframe = %timeframe, "Bulk backfill target is empty, nothing to do");
            return Ok(progress.into_iter().map(Progress::into_outcome).collect());
        };

        info!(
            timeframe = %timeframe,
            symbols = symbols.len(),
            count,
            start,
            end,
            "Bulk backfill started"
        );

        let mut round = 0u32;
        loop {
            let active = progress.iter().filter(|p| p.cursor_end.is_some()).count();
            if active == 0 {
                break;
            }
            round += 1;
            info!(round, active, completed = progress.len() - active, "Bulk backfill round");

            for p in progress.iter_mut() {
                let Some(cursor_end) = p.cursor_end else {
                    continue;
                };

                if self.engine.is_cancelled() {
                    p.report.stop = StopReason::Cancelled;
                    p.cursor_end = None;
                    continue;
                }

                debug!(
                    symbol = %p.symbol,
                    cursor_end,
                    candles = p.report.candles,
                    "Bulk backfill page"
                );

                match self
                    .engine
                    .backward_page(&p.symbol, timeframe, start, cursor_end, &mut p.report)
                    .await
                {
                    Ok(Step::Continue(next)) => p.cursor_end = Some(next),
                    Ok(Step::Done) => {
                        p.cursor_end = None;
                        self.engine.finish(&p.symbol, timeframe, &p.report);
                    }
                    Err(e) => {
                        error!(symbol = %p.symbol, timeframe = %timeframe, error = %e, "Bulk backfill failed");
                        p.cursor_end = None;
                        p.error = Some(e);
                    }
                }

                self.engine.pause().await;
            }
        }

        let outcomes: Vec<SymbolOutcome> = progress.into_iter().map(Progress::into_outcome).collect();
        let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
        let candles: usize = outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().ok())
            .map(|r| r.candles)
            .sum();

        info!(
            timeframe = %timeframe,
            rounds = round,
            symbols = outcomes.len(),
            failed,
            candles,
            "Bulk backfill completed"
        );
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backfill::testing::SyntheticHistory;
    use crate::backfill::NoDataCause;
    use crate::config::BackfillConfig;
    use crate::store::{CandleStore, MemoryCandleStore};
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    const MIN: i64 = 60_000;

    fn engine(history: Arc<SyntheticHistory>, store: Arc<MemoryCandleStore>, limit: usize) -> BackfillEngine {
        BackfillEngine::new(
            history,
            store,
            &BackfillConfig {
                page_limit: limit,
                request_delay: Duration::ZERO,
            },
        )
    }

    fn symbols(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_target_range() {
        // clock at minute 100: newest closed bucket is minute 99
        assert_eq!(
            BulkBackfill::target_range(Timeframe::M1, 100 * MIN, 10),
            Some((90 * MIN, 99 * MIN))
        );
        assert_eq!(
            BulkBackfill::target_range(Timeframe::M1, 100 * MIN, 1000),
            Some((0, 99 * MIN))
        );
        assert_eq!(BulkBackfill::target_range(Timeframe::M1, 100 * MIN, 0), None);
    }

    #[tokio::test]
    async fn test_symbols_take_turns_one_page_each() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 1000));
        let store = Arc::new(MemoryCandleStore::new());
        let bulk = BulkBackfill::new(Arc::new(engine(history.clone(), store.clone(), 100)));

        let outcomes = bulk
            .run(&symbols(&["BTCUSDT", "ETHUSDT"]), Timeframe::M1, 300)
            .await
            .unwrap();

        let order: Vec<String> = history.requests().into_iter().map(|r| r.symbol).collect();
        assert_eq!(
            order,
            symbols(&["BTCUSDT", "ETHUSDT", "BTCUSDT", "ETHUSDT", "BTCUSDT", "ETHUSDT"])
        );

        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            let report = outcome.result.as_ref().unwrap();
            assert_eq!(report.stop, StopReason::Boundary);
            assert_eq!(report.pages, 3);
            assert_eq!(report.candles, 300);
        }

        let rows = store
            .range_query("ETHUSDT", Timeframe::M1, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.first().unwrap().open_time, 700 * MIN);
        assert_eq!(rows.last().unwrap().open_time, 999 * MIN);
    }

    #[tokio::test]
    async fn test_short_history_leaves_rotation_early() {
        // listed at minute 950, so only 50 buckets exist before the clock
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 950, 1000));
        let store = Arc::new(MemoryCandleStore::new());
        let bulk = BulkBackfill::new(Arc::new(engine(history.clone(), store, 20)));

        let outcomes = bulk
            .run(&symbols(&["NEWUSDT"]), Timeframe::M1, 100)
            .await
            .unwrap();

        let report = outcomes[0].result.as_ref().unwrap();
        assert_eq!(report.candles, 50);
        assert_eq!(report.stop, StopReason::NoData(NoDataCause::Empty));
    }

    #[tokio::test]
    async fn test_storage_failure_is_reported_per_symbol() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 100));
        let store = Arc::new(MemoryCandleStore::new());
        store.set_unavailable(true);
        let bulk = BulkBackfill::new(Arc::new(engine(history, store, 50)));

        let outcomes = bulk
            .run(&symbols(&["BTCUSDT", "ETHUSDT"]), Timeframe::M1, 10)
            .await
            .unwrap();

        assert_eq!(outcomes[0].symbol, "BTCUSDT");
        assert!(matches!(outcomes[0].result, Err(BackfillError::Storage(_))));
        assert!(matches!(outcomes[1].result, Err(BackfillError::Storage(_))));
    }

    #[tokio::test]
    async fn test_cancelled_run_makes_no_requests() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 100));
        let store = Arc::new(MemoryCandleStore::new());
        let token = CancellationToken::new();
        token.cancel();
        let bulk = BulkBackfill::new(Arc::new(
            engine(history.clone(), store, 50).with_cancellation(token),
        ));

        let outcomes = bulk
            .run(&symbols(&["BTCUSDT", "ETHUSDT"]), Timeframe::M1, 10)
            .await
            .unwrap();

        assert!(history.requests().is_empty());
        for outcome in outcomes {
            assert_eq!(outcome.result.unwrap().stop, StopReason::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_server_time_failure_is_returned() {
        let history = Arc::new(SyntheticHistory::failing());
        let store = Arc::new(MemoryCandleStore::new());
        let bulk = BulkBackfill::new(Arc::new(engine(history, store, 50)));

        let err = bulk.run(&symbols(&["BTCUSDT"]), Timeframe::M1, 10).await;
        assert!(matches!(err, Err(FetchError::Response(_))));
    }
}
