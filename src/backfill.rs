//! Cursor-paginated REST backfill.
//!
//! Two directions share one engine:
//! - `backfill` walks backward from `end` toward `start`, one page per call,
//!   moving the cursor to just before the oldest candle it received.
//! - `catch_up` walks forward from `start` to `end`, moving the cursor to
//!   just after the newest candle it received.
//!
//! The cursor must move strictly in its direction on every page; a cursor
//! that does not move aborts the call with `BackfillError::Stall`.
//!
//! An empty page and a failed REST call both end the loop. The report keeps
//! the two apart as `NoDataCause::Empty` and `NoDataCause::Transport`, but
//! neither is retried.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::candle::Candle;
use crate::config::BackfillConfig;
use crate::decoder::{decode_rest_row, rest_row_open_time, RawKline};
use crate::errors::BackfillError;
use crate::rest::{KlineHistory, KlineRequest};
use crate::store::CandleStore;
use crate::timeframe::Timeframe;

/// Why a backfill call stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The requested boundary was reached.
    Boundary,
    /// A forward page came back shorter than the page limit.
    ShortPage,
    /// Nothing came back.
    NoData(NoDataCause),
    /// Shutdown was requested mid-run.
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoDataCause {
    /// The exchange answered with an empty page.
    Empty,
    /// The REST call failed.
    Transport,
}

/// Outcome of one `backfill` or `catch_up` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub pages: u32,
    pub candles: usize,
    /// Rows dropped because they failed to decode
    pub skipped: usize,
    pub stop: StopReason,
}

impl BackfillReport {
    pub(crate) fn new() -> Self {
        Self {
            pages: 0,
            candles: 0,
            skipped: 0,
            stop: StopReason::Boundary,
        }
    }
}

/// Result of one backward page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    /// More to fetch; the next page ends at this open time.
    Continue(i64),
    Done,
}

#[derive(Debug, Default)]
struct BackfillCounters {
    pages: AtomicU64,
    candles: AtomicU64,
    stalls: AtomicU64,
}

/// Running totals across all calls, for health reporting.
#[derive(Debug, Clone)]
pub struct BackfillStats {
    counters: Arc<BackfillCounters>,
}

impl BackfillStats {
    pub fn pages(&self) -> u64 {
        self.counters.pages.load(Ordering::Relaxed)
    }

    pub fn candles(&self) -> u64 {
        self.counters.candles.load(Ordering::Relaxed)
    }

    pub fn stalls(&self) -> u64 {
        self.counters.stalls.load(Ordering::Relaxed)
    }
}

pub struct BackfillEngine {
    history: Arc<dyn KlineHistory>,
    store: Arc<dyn CandleStore>,
    page_limit: usize,
    request_delay: Duration,
    cancel: CancellationToken,
    counters: Arc<BackfillCounters>,
}

impl BackfillEngine {
    pub fn new(
        history: Arc<dyn KlineHistory>,
        store: Arc<dyn CandleStore>,
        config: &BackfillConfig,
    ) -> Self {
        Self {
            history,
            store,
            page_limit: config.page_limit.max(1),
            request_delay: config.request_delay,
            cancel: CancellationToken::new(),
            counters: Arc::new(BackfillCounters::default()),
        }
    }

    /// Stop paging as soon as `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn stats(&self) -> BackfillStats {
        BackfillStats {
            counters: self.counters.clone(),
        }
    }

    pub fn history(&self) -> &Arc<dyn KlineHistory> {
        &self.history
    }

    pub fn store(&self) -> &Arc<dyn CandleStore> {
        &self.store
    }

    /// Fill `[start, end]` (open times, inclusive) walking backward from `end`.
    pub async fn backfill(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<BackfillReport, BackfillError> {
        let mut report = BackfillReport::new();
        if start > end {
            return Ok(report);
        }

        info!(
            symbol,
            timeframe = %timeframe,
            start,
            end,
            "Backfill started"
        );

        let mut cursor_end = end;

        loop {
            if self.cancel.is_cancelled() {
                report.stop = StopReason::Cancelled;
                break;
            }

            match self
                .backward_page(symbol, timeframe, start, cursor_end, &mut report)
                .await?
            {
                Step::Continue(next) => cursor_end = next,
                Step::Done => break,
            }

            self.pause().await;
        }

        self.finish(symbol, timeframe, &report);
        Ok(report)
    }

    /// Fetch and write the backward page ending at `cursor_end`. On `Done`
    /// the stop reason is already recorded in `report`.
    pub(crate) async fn backward_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        cursor_end: i64,
        report: &mut BackfillReport,
    ) -> Result<Step, BackfillError> {
        let page_span = timeframe.duration_ms() * self.page_limit as i64;
        let request = KlineRequest {
            symbol: symbol.to_string(),
            timeframe,
            start_time: Some(start.max(cursor_end - page_span + 1)),
            end_time: Some(cursor_end),
            limit: self.page_limit,
        };

        let Some(rows) = self.fetch_page(&request, report).await else {
            return Ok(Step::Done);
        };

        let Some(oldest_open) = rows.iter().filter_map(|r| rest_row_open_time(r)).min() else {
            return Err(self.stall(symbol, timeframe, cursor_end, cursor_end));
        };

        self.write_page(symbol, timeframe, &rows, report).await?;

        if oldest_open <= start {
            report.stop = StopReason::Boundary;
            return Ok(Step::Done);
        }

        let next = oldest_open - 1;
        if next >= cursor_end {
            return Err(self.stall(symbol, timeframe, cursor_end, next));
        }
        Ok(Step::Continue(next))
    }

    /// Fill `[start, end]` walking forward from `start`.
    pub async fn catch_up(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<BackfillReport, BackfillError> {
        let mut report = BackfillReport::new();
        if start > end {
            return Ok(report);
        }

        info!(
            symbol,
            timeframe = %timeframe,
            start,
            end,
            "Catch-up started"
        );

        let mut cursor = start;

        loop {
            if self.cancel.is_cancelled() {
                report.stop = StopReason::Cancelled;
                break;
            }

            let request = KlineRequest {
                symbol: symbol.to_string(),
                timeframe,
                start_time: Some(cursor),
                end_time: Some(end),
                limit: self.page_limit,
            };

            let rows = match self.fetch_page(&request, &mut report).await {
                Some(rows) => rows,
                None => break,
            };

            let Some(newest_open) = rows.iter().filter_map(|r| rest_row_open_time(r)).max() else {
                return Err(self.stall(symbol, timeframe, cursor, cursor));
            };

            self.write_page(symbol, timeframe, &rows, &mut report).await?;

            if newest_open >= end {
                report.stop = StopReason::Boundary;
                break;
            }
            if rows.len() < self.page_limit {
                report.stop = StopReason::ShortPage;
                break;
            }

            let next = newest_open + 1;
            if next <= cursor {
                return Err(self.stall(symbol, timeframe, cursor, next));
            }
            cursor = next;

            self.pause().await;
        }

        self.finish(symbol, timeframe, &report);
        Ok(report)
    }

    /// One REST call. `None` means the loop should stop; the reason is
    /// already recorded in `report`.
    async fn fetch_page(
        &self,
        request: &KlineRequest,
        report: &mut BackfillReport,
    ) -> Option<Vec<RawKline>> {
        report.pages += 1;
        self.counters.pages.fetch_add(1, Ordering::Relaxed);

        match self.history.fetch_klines(request).await {
            Ok(rows) if rows.is_empty() => {
                debug!(
                    symbol = %request.symbol,
                    timeframe = %request.timeframe,
                    start = ?request.start_time,
                    end = ?request.end_time,
                    "Empty kline page"
                );
                report.stop = StopReason::NoData(NoDataCause::Empty);
                None
            }
            Ok(rows) => Some(rows),
            Err(e) => {
                warn!(
                    symbol = %request.symbol,
                    timeframe = %request.timeframe,
                    error = %e,
                    "Kline request failed, ending backfill"
                );
                report.stop = StopReason::NoData(NoDataCause::Transport);
                None
            }
        }
    }

    async fn write_page(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        rows: &[RawKline],
        report: &mut BackfillReport,
    ) -> Result<(), BackfillError> {
        let mut candles: Vec<Candle> = Vec::with_capacity(rows.len());
        for row in rows {
            match decode_rest_row(symbol, timeframe, row) {
                Ok(candle) => candles.push(candle),
                Err(e) => {
                    warn!(symbol, timeframe = %timeframe, error = %e, "Skipping malformed kline row");
                    report.skipped += 1;
                }
            }
        }

        self.store.upsert_batch(timeframe, &candles).await?;
        report.candles += candles.len();
        self.counters
            .candles
            .fetch_add(candles.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) async fn pause(&self) {
        if self.request_delay.is_zero() {
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(self.request_delay) => {}
        }
    }

    fn stall(&self, symbol: &str, timeframe: Timeframe, previous: i64, next: i64) -> BackfillError {
        self.counters.stalls.fetch_add(1, Ordering::Relaxed);
        let err = BackfillError::Stall {
            symbol: symbol.to_string(),
            timeframe,
            previous,
            next,
        };
        warn!(error = %err, "Backfill aborted");
        err
    }

    pub(crate) fn finish(&self, symbol: &str, timeframe: Timeframe, report: &BackfillReport) {
        info!(
            symbol,
            timeframe = %timeframe,
            pages = report.pages,
            candles = report.candles,
            skipped = report.skipped,
            stop = ?report.stop,
            "Backfill done"
        );
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{kline_row, SyntheticHistory};
    use super::*;
    use crate::errors::FetchError;
    use crate::store::MemoryCandleStore;
    use async_trait::async_trait;
    use serde_json::json;

    const MIN: i64 = 60_000;

    fn engine(history: Arc<dyn KlineHistory>, store: Arc<MemoryCandleStore>, limit: usize) -> BackfillEngine {
        BackfillEngine::new(
            history,
            store,
            &BackfillConfig {
                page_limit: limit,
                request_delay: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_backward_reaches_start_in_bounded_pages() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 2000));
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history.clone(), store.clone(), 100);

        let (start, end) = (0, 999 * MIN);
        let report = engine.backfill("BTCUSDT", Timeframe::M1, start, end).await.unwrap();

        assert_eq!(report.stop, StopReason::Boundary);
        assert_eq!(report.candles, 1000);
        assert_eq!(store.row_count(Timeframe::M1), 1000);

        let page_span = 100 * MIN;
        let bound = ((end - start) / page_span + 1) as u32;
        assert!(report.pages <= bound, "{} pages > bound {}", report.pages, bound);

        for req in history.requests() {
            assert!(req.end_time.unwrap() >= start - MIN);
            assert!(req.start_time.unwrap() >= start);
        }
    }

    #[tokio::test]
    async fn test_backward_gap_range_only_writes_gap() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 2000));
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history.clone(), store.clone(), 500);

        let report = engine
            .backfill("ETHUSDT", Timeframe::M1, 61 * MIN, 120 * MIN)
            .await
            .unwrap();

        assert_eq!(report.pages, 1);
        assert_eq!(report.candles, 60);
        let rows = store
            .range_query("ETHUSDT", Timeframe::M1, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.first().unwrap().open_time, 61 * MIN);
        assert_eq!(rows.last().unwrap().open_time, 120 * MIN);
    }

    #[tokio::test]
    async fn test_backward_stops_when_history_runs_out() {
        // listing starts at minute 500, caller asks from 0
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 500, 1000));
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history, store.clone(), 200);

        let report = engine.backfill("SOLUSDT", Timeframe::M1, 0, 999 * MIN).await.unwrap();

        assert_eq!(report.stop, StopReason::NoData(NoDataCause::Empty));
        assert_eq!(report.candles, 500);
    }

    #[tokio::test]
    async fn test_transport_failure_is_named_no_data() {
        let history = Arc::new(SyntheticHistory::failing());
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history, store.clone(), 100);

        let report = engine.backfill("BTCUSDT", Timeframe::M1, 0, 10 * MIN).await.unwrap();
        assert_eq!(report.stop, StopReason::NoData(NoDataCause::Transport));
        assert_eq!(report.pages, 1);
        assert_eq!(report.candles, 0);
    }

    struct RepeatingHistory;

    #[async_trait]
    impl KlineHistory for RepeatingHistory {
        async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<RawKline>, FetchError> {
            Ok((100..110).map(|m| kline_row(request.timeframe, m * MIN)).collect())
        }

        async fn server_time(&self) -> Result<i64, FetchError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_backward_stall_aborts() {
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(Arc::new(RepeatingHistory), store, 10);

        let err = engine
            .backfill("BTCUSDT", Timeframe::M1, 0, 500 * MIN)
            .await
            .unwrap_err();
        match err {
            BackfillError::Stall { previous, next, .. } => {
                assert_eq!(previous, 100 * MIN - 1);
                assert_eq!(next, 100 * MIN - 1);
            }
            other => panic!("expected stall, got {other}"),
        }
        assert_eq!(engine.stats().stalls(), 1);
    }

    #[tokio::test]
    async fn test_forward_stall_aborts() {
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(Arc::new(RepeatingHistory), store, 10);

        let err = engine
            .catch_up("BTCUSDT", Timeframe::M1, 0, 500 * MIN)
            .await
            .unwrap_err();
        assert!(matches!(err, BackfillError::Stall { .. }));
    }

    #[tokio::test]
    async fn test_forward_catch_up_to_boundary() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 250));
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history.clone(), store.clone(), 100);

        let report = engine
            .catch_up("BTCUSDT", Timeframe::M1, 10 * MIN, 245 * MIN)
            .await
            .unwrap();

        assert_eq!(report.stop, StopReason::Boundary);
        assert_eq!(report.pages, 3);
        assert_eq!(report.candles, 236);

        let starts: Vec<i64> = history
            .requests()
            .iter()
            .map(|r| r.start_time.unwrap())
            .collect();
        assert_eq!(starts, vec![10 * MIN, 110 * MIN, 210 * MIN]);
    }

    #[tokio::test]
    async fn test_forward_short_page_stops() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 151));
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history, store, 100);

        let report = engine
            .catch_up("BTCUSDT", Timeframe::M1, 10 * MIN, 245 * MIN)
            .await
            .unwrap();
        assert_eq!(report.stop, StopReason::ShortPage);
        assert_eq!(report.candles, 141);
    }

    struct OneBadRow;

    #[async_trait]
    impl KlineHistory for OneBadRow {
        async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<RawKline>, FetchError> {
            let mut rows: Vec<RawKline> = (0..3).map(|m| kline_row(request.timeframe, m * MIN)).collect();
            rows[1][2] = json!("not-a-price");
            Ok(rows)
        }

        async fn server_time(&self) -> Result<i64, FetchError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_malformed_rows_are_skipped() {
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(Arc::new(OneBadRow), store.clone(), 500);

        let report = engine.backfill("BTCUSDT", Timeframe::M1, 0, 2 * MIN).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.candles, 2);
        assert_eq!(store.row_count(Timeframe::M1), 2);
    }

    #[tokio::test]
    async fn test_storage_failure_aborts() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 10));
        let store = Arc::new(MemoryCandleStore::new());
        store.set_unavailable(true);
        let engine = engine(history, store, 100);

        let err = engine.backfill("BTCUSDT", Timeframe::M1, 0, 9 * MIN).await.unwrap_err();
        assert!(matches!(err, BackfillError::Storage(_)));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 10));
        let store = Arc::new(MemoryCandleStore::new());
        let token = CancellationToken::new();
        token.cancel();
        let engine = engine(history.clone(), store, 100).with_cancellation(token);

        let report = engine.backfill("BTCUSDT", Timeframe::M1, 0, 9 * MIN).await.unwrap();
        assert_eq!(report.stop, StopReason::Cancelled);
        assert!(history.requests().is_empty());
    }

    #[tokio::test]
    async fn test_empty_range_makes_no_requests() {
        let history = Arc::new(SyntheticHistory::buckets(Timeframe::M1, 0, 10));
        let store = Arc::new(MemoryCandleStore::new());
        let engine = engine(history.clone(), store, 100);

        let report = engine.backfill("BTCUSDT", Timeframe::M1, 5 * MIN, 4 * MIN).await.unwrap();
        assert_eq!(report.pages, 0);
        assert!(history.requests().is_empty());
    }
}
