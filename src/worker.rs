//! Persistence worker: drains the ingest queue into the store.
//!
//! The worker is the only owner of the `Aggregator`. Every queued candle is
//! upserted; base-timeframe candles are then fed to the aggregator and any
//! buckets it finalizes are upserted under their own timeframe. A bucket the
//! aggregator only saw part of is rebuilt from the stored base rows instead,
//! and skipped when those are incomplete too. Store errors are logged and
//! counted, never fatal.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::aggregator::{Aggregator, Finalized};
use crate::candle::Candle;
use crate::queue::{IngestReceiver, Recv};
use crate::rebuild::CandleRebuilder;
use crate::store::CandleStore;
use crate::timeframe::Timeframe;

#[derive(Debug, Default)]
pub struct WorkerStats {
    written: AtomicU64,
    aggregated: AtomicU64,
    partial: AtomicU64,
    errors: AtomicU64,
}

impl WorkerStats {
    /// Queued candles upserted successfully.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Derived candles upserted successfully.
    pub fn aggregated(&self) -> u64 {
        self.aggregated.load(Ordering::Relaxed)
    }

    /// Derived windows dropped because their base rows were incomplete.
    pub fn partial(&self) -> u64 {
        self.partial.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}

pub struct PersistenceWorker {
    queue: IngestReceiver,
    store: Arc<dyn CandleStore>,
    aggregator: Aggregator,
    rebuilder: CandleRebuilder,
    poll_interval: Duration,
    stats: Arc<WorkerStats>,
}

impl PersistenceWorker {
    pub fn new(
        queue: IngestReceiver,
        store: Arc<dyn CandleStore>,
        aggregator: Aggregator,
        poll_interval: Duration,
    ) -> Self {
        Self {
            queue,
            rebuilder: CandleRebuilder::new(store.clone(), aggregator.base()),
            store,
            aggregator,
            poll_interval,
            stats: Arc::new(WorkerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Run until cancelled or until every producer has gone away.
    ///
    /// Items still queued at cancellation are not drained; in-flight
    /// aggregation buckets are dropped with the worker.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            base = %self.aggregator.base(),
            targets = ?self.aggregator.targets(),
            "Persistence worker started"
        );

        loop {
            if cancel.is_cancelled() {
                break;
            }

            match self.queue.get_with_timeout(self.poll_interval).await {
                Recv::Item((timeframe, candle)) => self.process(timeframe, candle).await,
                Recv::Timeout => continue,
                Recv::Closed => {
                    info!("Ingest queue closed");
                    break;
                }
            }
        }

        info!(
            written = self.stats.written(),
            aggregated = self.stats.aggregated(),
            errors = self.stats.errors(),
            pending_buckets = self.aggregator.pending_count(),
            "Persistence worker stopped"
        );
    }

    /// Persist one queued candle and whatever it finalizes.
    pub async fn process(&mut self, timeframe: Timeframe, candle: Candle) {
        match self.store.upsert(timeframe, &candle).await {
            Ok(()) => {
                self.stats.written.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %candle.symbol, timeframe = %timeframe, open_time = candle.open_time, "Candle stored");
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    symbol = %candle.symbol,
                    timeframe = %timeframe,
                    open_time = candle.open_time,
                    error = %e,
                    "Failed to store candle"
                );
            }
        }

        if timeframe != self.aggregator.base() {
            return;
        }

        for finalized in self.aggregator.push(&candle) {
            self.persist_derived(finalized).await;
        }
    }

    async fn persist_derived(&self, finalized: Finalized) {
        let Finalized { candle: derived, complete } = finalized;

        if !complete {
            match self
                .rebuilder
                .rebuild(&derived.symbol, derived.timeframe, derived.open_time)
                .await
            {
                Ok(true) => {
                    self.stats.aggregated.fetch_add(1, Ordering::Relaxed);
                    info!(
                        symbol = %derived.symbol,
                        timeframe = %derived.timeframe,
                        open_time = derived.open_time,
                        "Derived candle rebuilt from stored base rows"
                    );
                }
                Ok(false) => {
                    self.stats.partial.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        symbol = %derived.symbol,
                        timeframe = %derived.timeframe,
                        open_time = derived.open_time,
                        "Skipping derived candle with incomplete base window"
                    );
                }
                Err(e) => {
                    self.stats.errors.fetch_add(1, Ordering::Relaxed);
                    error!(
                        symbol = %derived.symbol,
                        timeframe = %derived.timeframe,
                        open_time = derived.open_time,
                        error = %e,
                        "Failed to rebuild derived candle"
                    );
                }
            }
            return;
        }

        match self.store.upsert(derived.timeframe, &derived).await {
            Ok(()) => {
                self.stats.aggregated.fetch_add(1, Ordering::Relaxed);
                info!(
                    symbol = %derived.symbol,
                    timeframe = %derived.timeframe,
                    open_time = derived.open_time,
                    "Derived candle finalized"
                );
            }
            Err(e) => {
                self.stats.errors.fetch_add(1, Ordering::Relaxed);
                error!(
                    symbol = %derived.symbol,
                    timeframe = %derived.timeframe,
                    open_time = derived.open_time,
                    error = %e,
                    "Failed to store derived candle"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::fixtures::minute_candle;
    use crate::queue::ingest_queue;
    use crate::store::MemoryCandleStore;
    use rust_decimal_macros::dec;

    fn worker(store: Arc<MemoryCandleStore>) -> (PersistenceWorker, crate::queue::IngestSender) {
        let (tx, rx) = ingest_queue(64);
        let worker = PersistenceWorker::new(
            rx,
            store,
            Aggregator::new(Timeframe::M1, [Timeframe::M15]),
            Duration::from_millis(10),
        );
        (worker, tx)
    }

    #[tokio::test]
    async fn test_base_candles_are_stored_and_aggregated() {
        let store = Arc::new(MemoryCandleStore::new());
        let (mut worker, _tx) = worker(store.clone());

        for minute in 0..16 {
            worker.process(Timeframe::M1, minute_candle("BTCUSDT", minute)).await;
        }

        assert_eq!(store.row_count(Timeframe::M1), 16);
        let quarter = store
            .range_query("BTCUSDT", Timeframe::M15, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(quarter.len(), 1);
        assert_eq!(quarter[0].open_time, 0);
        assert_eq!(quarter[0].close_time, 15 * 60_000 - 1);
        assert_eq!(quarter[0].base_volume, dec!(30));
        assert!(quarter[0].is_closed);

        let stats = worker.stats();
        assert_eq!(stats.written(), 16);
        assert_eq!(stats.aggregated(), 1);
    }

    #[tokio::test]
    async fn test_non_base_candles_skip_aggregator() {
        let store = Arc::new(MemoryCandleStore::new());
        let (mut worker, _tx) = worker(store.clone());

        let mut hourly = minute_candle("BTCUSDT", 0);
        hourly.timeframe = Timeframe::H1;
        hourly.close_time = 3_600_000 - 1;
        worker.process(Timeframe::H1, hourly).await;

        assert_eq!(store.row_count(Timeframe::H1), 1);
        assert_eq!(worker.aggregator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_store_outage_does_not_stop_aggregation() {
        let store = Arc::new(MemoryCandleStore::new());
        let (mut worker, _tx) = worker(store.clone());

        store.set_unavailable(true);
        for minute in 0..15 {
            worker.process(Timeframe::M1, minute_candle("BTCUSDT", minute)).await;
        }
        assert_eq!(worker.stats().errors(), 15);

        store.set_unavailable(false);
        worker.process(Timeframe::M1, minute_candle("BTCUSDT", 15)).await;

        assert_eq!(store.row_count(Timeframe::M1), 1);
        assert_eq!(store.row_count(Timeframe::M15), 1);
    }

    #[tokio::test]
    async fn test_partial_first_window_is_not_persisted_as_closed() {
        let store = Arc::new(MemoryCandleStore::new());
        let (mut worker, _tx) = worker(store.clone());

        // started at 00:07 with nothing stored before it
        for minute in 7..=15 {
            worker.process(Timeframe::M1, minute_candle("BTCUSDT", minute)).await;
        }

        assert_eq!(store.row_count(Timeframe::M15), 0);
        assert_eq!(worker.stats().partial(), 1);
        assert_eq!(worker.stats().aggregated(), 0);
    }

    #[tokio::test]
    async fn test_partial_window_rebuilt_from_stored_base_rows() {
        let store = Arc::new(MemoryCandleStore::new());
        // 00:00..00:06 came from the startup catch-up
        let earlier: Vec<_> = (0..7).map(|m| minute_candle("BTCUSDT", m)).collect();
        store.upsert_batch(Timeframe::M1, &earlier).await.unwrap();
        let (mut worker, _tx) = worker(store.clone());

        for minute in 7..=15 {
            worker.process(Timeframe::M1, minute_candle("BTCUSDT", minute)).await;
        }

        let quarter = store
            .range_query("BTCUSDT", Timeframe::M15, 0, 0)
            .await
            .unwrap();
        assert_eq!(quarter.len(), 1);
        assert_eq!(quarter[0].base_volume, dec!(30));
        assert_eq!(quarter[0].first_trade_id, Some(0));
        assert!(quarter[0].is_closed);
        assert_eq!(worker.stats().aggregated(), 1);
        assert_eq!(worker.stats().partial(), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops_on_cancel() {
        let store = Arc::new(MemoryCandleStore::new());
        let (worker, tx) = worker(store.clone());
        let stats = worker.stats();
        let cancel = CancellationToken::new();

        let handle = tokio::spawn(worker.run(cancel.clone()));
        for minute in 0..3 {
            assert!(tx.try_put(Timeframe::M1, minute_candle("ETHUSDT", minute)));
        }

        for _ in 0..100 {
            if stats.written() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.row_count(Timeframe::M1), 3);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_run_exits_when_producers_are_gone() {
        let store = Arc::new(MemoryCandleStore::new());
        let (worker, tx) = worker(store);
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), worker.run(CancellationToken::new()))
            .await
            .unwrap();
    }
}
