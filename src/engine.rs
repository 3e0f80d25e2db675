//! Service wiring.
//!
//! `FeederEngine` owns every shared handle and runs the units in order:
//! startup sync first, then the symbol watcher, stream connector,
//! persistence worker, gap watchdog, metrics updater and health server.
//! All units share one `CancellationToken`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::aggregator::Aggregator;
use crate::backfill::{BackfillEngine, BackfillStats};
use crate::config::Config;
use crate::errors::Result;
use crate::health::{run_health_server, HealthState, MetricsSnapshot};
use crate::queue::{ingest_queue, QueueStats};
use crate::reconcile::{GapWatchdog, StartupSync};
use crate::rest::KlineHistory;
use crate::store::CandleStore;
use crate::stream::{StreamConnector, StreamStats, SymbolWatcher};
use crate::symbols::SymbolSource;
use crate::worker::{PersistenceWorker, WorkerStats};

/// Metrics updater interval.
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

pub struct FeederEngine {
    config: Config,
    store: Arc<dyn CandleStore>,
    history: Arc<dyn KlineHistory>,
    symbols: Arc<dyn SymbolSource>,
    health: HealthState,
    cancel: CancellationToken,
}

impl FeederEngine {
    pub fn new(
        config: Config,
        store: Arc<dyn CandleStore>,
        history: Arc<dyn KlineHistory>,
        symbols: Arc<dyn SymbolSource>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            history,
            symbols,
            health: HealthState::new(),
            cancel,
        }
    }

    pub fn health(&self) -> HealthState {
        self.health.clone()
    }

    /// Run until the cancellation token fires, then wait (bounded) for
    /// every unit to stop.
    pub async fn run(self) -> Result<()> {
        let plan = self.config.timeframes.clone();
        info!(
            base = %plan.base,
            derived = ?plan.derived,
            rest_synced = ?plan.rest_synced(),
            "Starting candle feeder"
        );

        let backfill = Arc::new(
            BackfillEngine::new(self.history.clone(), self.store.clone(), &self.config.backfill)
                .with_cancellation(self.cancel.clone()),
        );

        let sync = StartupSync::new(backfill.clone(), plan.clone(), self.cancel.clone());
        if let Err(e) = sync.run().await {
            error!(error = %e, "Startup sync failed, starting live ingestion anyway");
        }
        if self.cancel.is_cancelled() {
            info!("Shutdown requested during startup sync");
            return Ok(());
        }

        let (tx, rx) = ingest_queue(self.config.ingest.queue_capacity);
        let queue_stats = tx.stats();

        let (watcher, desired) =
            SymbolWatcher::new(self.symbols.clone(), self.config.stream.symbol_refresh_interval);
        let connector = StreamConnector::new(
            self.config.stream.clone(),
            plan.base,
            self.symbols.clone(),
            desired,
            tx,
        );
        let stream_stats = connector.stats();

        let worker = PersistenceWorker::new(
            rx,
            self.store.clone(),
            Aggregator::new(plan.base, plan.derived.iter().copied()),
            self.config.ingest.poll_interval,
        );
        let worker_stats = worker.stats();

        let watchdog = Arc::new(GapWatchdog::new(backfill.clone(), &plan, &self.config.watchdog));

        let sources = MetricSources {
            store: self.store.clone(),
            queue: queue_stats,
            stream: stream_stats,
            worker: worker_stats,
            backfill: backfill.stats(),
            watchdog: watchdog.clone(),
        };

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        tasks.push(("symbol-watcher", tokio::spawn({
            let cancel = self.cancel.clone();
            async move { watcher.run(cancel).await }
        })));

        tasks.push(("stream-connector", tokio::spawn({
            let cancel = self.cancel.clone();
            async move { connector.run(cancel).await }
        })));

        tasks.push(("persistence-worker", tokio::spawn(worker.run(self.cancel.clone()))));

        tasks.push(("gap-watchdog", tokio::spawn({
            let cancel = self.cancel.clone();
            let watchdog = watchdog.clone();
            async move { watchdog.run(cancel).await }
        })));

        tasks.push(("metrics-updater", tokio::spawn({
            let cancel = self.cancel.clone();
            let health = self.health.clone();
            async move { run_metrics_updater(sources, health, cancel).await }
        })));

        tasks.push(("health-server", tokio::spawn({
            let cancel = self.cancel.clone();
            let health = self.health.clone();
            let port = self.config.health_check_port;
            async move {
                if let Err(e) = run_health_server(port, health, cancel).await {
                    error!("Health server error: {}", e);
                }
            }
        })));

        info!("Service started, waiting for shutdown signal...");
        self.cancel.cancelled().await;
        info!("Shutdown signal received, initiating graceful shutdown...");

        let join_all = async {
            for (name, handle) in tasks {
                if let Err(e) = handle.await {
                    error!(task = name, error = %e, "Task ended abnormally");
                }
            }
        };

        match tokio::time::timeout(self.config.shutdown_timeout, join_all).await {
            Ok(()) => info!("All tasks completed gracefully"),
            Err(_) => warn!(timeout = ?self.config.shutdown_timeout, "Shutdown timeout reached, forcing exit"),
        }

        Ok(())
    }
}

/// Handles the metrics updater reads from.
struct MetricSources {
    store: Arc<dyn CandleStore>,
    queue: QueueStats,
    stream: Arc<StreamStats>,
    worker: Arc<WorkerStats>,
    backfill: BackfillStats,
    watchdog: Arc<GapWatchdog>,
}

impl MetricSources {
    async fn collect(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            candles_received: self.stream.received(),
            candles_forwarded: self.stream.forwarded(),
            candles_dropped: self.queue.dropped(),
            candles_written: self.worker.written(),
            aggregated_written: self.worker.aggregated(),
            partial_windows: self.worker.partial(),
            backfilled_candles: self.backfill.candles(),
            gaps_detected: self.watchdog.gaps_detected(),
            decode_errors: self.stream.decode_errors(),
            storage_errors: self.worker.errors(),
            backfill_stalls: self.backfill.stalls(),
            reconnects: self.stream.reconnects(),
            queue_depth: self.queue.depth(),
            subscribed_symbols: self.stream.subscribed(),
            websocket_connected: self.stream.is_connected(),
            database_connected: self.store.ping().await,
            last_candle_open_time: self.stream.last_open_time(),
        }
    }
}

async fn run_metrics_updater(sources: MetricSources, health: HealthState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(METRICS_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => health.record(sources.collect().await),
        }
    }
}
