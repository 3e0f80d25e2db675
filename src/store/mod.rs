//! Candle persistence.
//!
//! One table per timeframe keyed by `(symbol, open_time)`. Writes are
//! upserts: a second write to the same key overwrites every mutable column.

mod memory;
mod postgres;

pub use memory::MemoryCandleStore;
pub use postgres::PostgresCandleStore;

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::candle::Candle;
use crate::errors::StorageError;
use crate::timeframe::Timeframe;

#[async_trait]
pub trait CandleStore: Send + Sync {
    /// Insert or overwrite one candle.
    async fn upsert(&self, timeframe: Timeframe, candle: &Candle) -> Result<(), StorageError>;

    /// Insert or overwrite many candles in one transaction.
    async fn upsert_batch(&self, timeframe: Timeframe, candles: &[Candle]) -> Result<(), StorageError>;

    /// Largest stored open time for the symbol, if any row exists.
    async fn latest_open_time(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<i64>, StorageError>;

    async fn distinct_symbols(&self, timeframe: Timeframe) -> Result<BTreeSet<String>, StorageError>;

    /// Candles with `start <= open_time <= end`, oldest first.
    async fn range_query(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, StorageError>;

    /// Cheap connectivity check.
    async fn ping(&self) -> bool {
        true
    }
}
