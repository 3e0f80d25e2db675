//! Candle Feeder Service
//!
//! Streams exchange klines into Postgres and keeps the stored history
//! complete.
//!
//! ## Features
//! - Live kline stream with dynamic symbol subscriptions
//! - Higher timeframes aggregated from the base stream
//! - Startup sync and periodic gap backfill over REST
//! - One-off bulk backfill of the whole symbol universe (`backfill`)
//! - Health check HTTP endpoint
//! - Graceful shutdown on SIGTERM

use std::sync::Arc;

use candle_feeder::config::{Config, StoreBackend};
use candle_feeder::errors::{FeederError, Result};
use candle_feeder::{
    BackfillEngine, BinanceRestClient, BulkBackfill, CandleStore, FeederEngine, MemoryCandleStore,
    PostgresCandleStore, RedisSymbolSource, StaticSymbolSource, SymbolSource, Timeframe,
};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "candle-feeder")]
#[command(about = "Streams exchange klines into per-timeframe candle tables", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the live feeder (default)
    Run,

    /// Fetch the newest candles for every tracked symbol, then exit
    Backfill {
        /// Timeframe to fill (e.g. 1m, 15m, 1h)
        #[arg(short, long, default_value = "1m")]
        timeframe: Timeframe,

        /// Candles per symbol, counted back from the last closed bucket
        #[arg(short, long, default_value = "1500")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration before tracing so LOG_LEVEL applies
    let config = Config::from_env()?;
    init_tracing(&config.log_level);

    info!("Starting Candle Feeder Service");
    info!("Configuration loaded:");
    info!("  Stream URL: {}", config.stream.url);
    info!("  REST URL: {}", config.rest.base_url);
    info!("  Store backend: {:?}", config.store_backend);
    info!("  Health check port: {}", config.health_check_port);

    let store = build_store(&config).await?;
    let history = Arc::new(BinanceRestClient::new(&config.rest)?);
    let symbols = build_symbol_source(&config)?;

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            wait_for_shutdown().await;
            cancel.cancel();
        }
    });

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            FeederEngine::new(config, store, history, symbols, cancel)
                .run()
                .await?;
        }
        Commands::Backfill { timeframe, count } => {
            if !config.timeframes.stored().contains(&timeframe) {
                return Err(FeederError::config(format!(
                    "timeframe {timeframe} has no table in the current timeframe plan"
                )));
            }

            let universe = symbols.symbols().await?;
            info!(symbols = universe.len(), timeframe = %timeframe, count, "Bulk backfill requested");

            let engine = BackfillEngine::new(history, store, &config.backfill).with_cancellation(cancel);
            let outcomes = BulkBackfill::new(Arc::new(engine))
                .run(&universe, timeframe, count)
                .await?;

            for outcome in &outcomes {
                match &outcome.result {
                    Ok(report) => info!(
                        symbol = %outcome.symbol,
                        pages = report.pages,
                        candles = report.candles,
                        stop = ?report.stop,
                        "Symbol done"
                    ),
                    Err(e) => error!(symbol = %outcome.symbol, error = %e, "Symbol failed"),
                }
            }
        }
    }

    info!("Candle Feeder Service stopped");
    Ok(())
}

async fn build_store(config: &Config) -> Result<Arc<dyn CandleStore>> {
    match config.store_backend {
        StoreBackend::Postgres => {
            info!(
                "Connecting to database {}:{}/{}",
                config.database.host, config.database.port, config.database.name
            );
            let store =
                PostgresCandleStore::connect(&config.database, &config.timeframes.stored()).await?;
            store.ensure_schema().await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            warn!("Using in-memory candle store, nothing will be persisted");
            Ok(Arc::new(MemoryCandleStore::new()))
        }
    }
}

fn build_symbol_source(config: &Config) -> Result<Arc<dyn SymbolSource>> {
    match &config.symbols.static_symbols {
        Some(list) => {
            info!(count = list.len(), "Using static symbol list");
            Ok(Arc::new(StaticSymbolSource::new(
                list.iter().cloned(),
                &config.symbols.quote_asset,
            )))
        }
        None => {
            info!(key = %config.symbols.key, "Reading symbols from Redis");
            Ok(Arc::new(RedisSymbolSource::new(&config.symbols)?))
        }
    }
}

/// Initialize tracing subscriber.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C");
        }
        _ = terminate => {
            info!("Received SIGTERM");
        }
    }
}
