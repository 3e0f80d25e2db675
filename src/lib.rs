//! Candle Feeder Library
//!
//! This crate provides components for streaming exchange klines into a
//! per-timeframe candle store, deriving higher timeframes from the base
//! stream, and reconciling gaps against the exchange REST history.

pub mod aggregator;
pub mod backfill;
pub mod bulk;
pub mod candle;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod errors;
pub mod health;
pub mod queue;
pub mod rebuild;
pub mod reconcile;
pub mod rest;
pub mod store;
pub mod stream;
pub mod symbols;
pub mod timeframe;
pub mod worker;

pub use aggregator::{Aggregator, Finalized};
pub use backfill::{BackfillEngine, BackfillReport, NoDataCause, StopReason};
pub use bulk::{BulkBackfill, SymbolOutcome};
pub use candle::Candle;
pub use config::{Config, TimeframePlan};
pub use engine::FeederEngine;
pub use errors::{BackfillError, DecodeError, FeederError, FetchError, Result, StorageError};
pub use health::{HealthResponse, HealthState, HealthStatus};
pub use queue::{ingest_queue, IngestReceiver, IngestSender};
pub use rebuild::CandleRebuilder;
pub use reconcile::{gap_range, GapWatchdog, StartupSync};
pub use rest::{BinanceRestClient, KlineHistory, KlineRequest};
pub use store::{CandleStore, MemoryCandleStore, PostgresCandleStore};
pub use stream::{StreamConnector, SubscriptionDelta, SubscriptionSet, SymbolWatcher};
pub use symbols::{RedisSymbolSource, StaticSymbolSource, SymbolSource};
pub use timeframe::Timeframe;
pub use worker::PersistenceWorker;
