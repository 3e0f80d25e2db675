//! In-process candle store with the same upsert semantics as Postgres.
//!
//! Selected with `STORE_BACKEND=memory` for dry runs against the live
//! stream, and used by the unit tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::CandleStore;
use crate::candle::Candle;
use crate::errors::StorageError;
use crate::timeframe::Timeframe;

type Series = BTreeMap<i64, Candle>;

#[derive(Default)]
pub struct MemoryCandleStore {
    tables: Mutex<BTreeMap<Timeframe, BTreeMap<String, Series>>>,
    unavailable: AtomicBool,
    writes: AtomicU64,
}

impl MemoryCandleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with `StorageError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of rows written (inserts and overwrites).
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Total number of stored rows for a timeframe.
    pub fn row_count(&self, timeframe: Timeframe) -> usize {
        self.tables
            .lock()
            .get(&timeframe)
            .map(|symbols| symbols.values().map(BTreeMap::len).sum())
            .unwrap_or(0)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }

    fn write_row(series: &mut Series, candle: &Candle) {
        match series.get_mut(&candle.open_time) {
            Some(existing) => {
                let open_interest = candle.open_interest.or(existing.open_interest);
                let funding_rate = candle.funding_rate.or(existing.funding_rate);
                *existing = candle.clone();
                existing.open_interest = open_interest;
                existing.funding_rate = funding_rate;
            }
            None => {
                series.insert(candle.open_time, candle.clone());
            }
        }
    }
}

#[async_trait]
impl CandleStore for MemoryCandleStore {
    async fn upsert(&self, timeframe: Timeframe, candle: &Candle) -> Result<(), StorageError> {
        self.upsert_batch(timeframe, std::slice::from_ref(candle)).await
    }

    async fn upsert_batch(&self, timeframe: Timeframe, candles: &[Candle]) -> Result<(), StorageError> {
        self.check()?;
        let mut tables = self.tables.lock();
        let table = tables.entry(timeframe).or_default();
        for candle in candles {
            let series = table.entry(candle.symbol.clone()).or_default();
            Self::write_row(series, candle);
        }
        self.writes.fetch_add(candles.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn latest_open_time(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<Option<i64>, StorageError> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .get(&timeframe)
            .and_then(|t| t.get(symbol))
            .and_then(|series| series.keys().next_back().copied()))
    }

    async fn distinct_symbols(&self, timeframe: Timeframe) -> Result<BTreeSet<String>, StorageError> {
        self.check()?;
        Ok(self
            .tables
            .lock()
            .get(&timeframe)
            .map(|t| t.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn range_query(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> Result<Vec<Candle>, StorageError> {
        self.check()?;
        if start > end {
            return Ok(Vec::new());
        }
        Ok(self
            .tables
            .lock()
            .get(&timeframe)
            .and_then(|t| t.get(symbol))
            .map(|series| series.range(start..=end).map(|(_, c)| c.clone()).collect())
            .unwrap_or_default())
    }

    async fn ping(&self) -> bool {
        self.check().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::fixtures::minute_candle;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_upsert_is_idempotent_last_write_wins() {
        let store = MemoryCandleStore::new();
        let mut c = minute_candle("ETHUSDT", 0);
        c.open_time = 1_700_000_000_000;
        c.close = dec!(100.0);
        c.high = dec!(102);
        store.upsert(Timeframe::M1, &c).await.unwrap();
        store.upsert(Timeframe::M1, &c).await.unwrap();

        c.close = dec!(101.0);
        store.upsert(Timeframe::M1, &c).await.unwrap();

        let rows = store
            .range_query("ETHUSDT", Timeframe::M1, 0, i64::MAX)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, dec!(101.0));
        assert_eq!(rows[0], c);
        // overwrites still count as writes
        assert_eq!(store.writes(), 3);
    }

    #[tokio::test]
    async fn test_enrichment_survives_live_overwrite() {
        let store = MemoryCandleStore::new();
        let mut backfilled = minute_candle("BTCUSDT", 3);
        backfilled.open_interest = Some(dec!(12345));
        store.upsert(Timeframe::M1, &backfilled).await.unwrap();

        let live = minute_candle("BTCUSDT", 3);
        store.upsert(Timeframe::M1, &live).await.unwrap();

        let rows = store.range_query("BTCUSDT", Timeframe::M1, 0, i64::MAX).await.unwrap();
        assert_eq!(rows[0].open_interest, Some(dec!(12345)));
    }

    #[tokio::test]
    async fn test_latest_and_distinct() {
        let store = MemoryCandleStore::new();
        assert_eq!(store.latest_open_time("BTCUSDT", Timeframe::M1).await.unwrap(), None);

        let batch: Vec<_> = [5, 1, 3].iter().map(|m| minute_candle("BTCUSDT", *m)).collect();
        store.upsert_batch(Timeframe::M1, &batch).await.unwrap();
        store.upsert(Timeframe::M1, &minute_candle("ETHUSDT", 0)).await.unwrap();

        assert_eq!(
            store.latest_open_time("BTCUSDT", Timeframe::M1).await.unwrap(),
            Some(5 * 60_000)
        );
        let symbols = store.distinct_symbols(Timeframe::M1).await.unwrap();
        assert_eq!(symbols.into_iter().collect::<Vec<_>>(), vec!["BTCUSDT", "ETHUSDT"]);
        assert!(store.distinct_symbols(Timeframe::M15).await.unwrap().is_empty());

        let range = store
            .range_query("BTCUSDT", Timeframe::M1, 60_000, 3 * 60_000)
            .await
            .unwrap();
        assert_eq!(range.iter().map(|c| c.open_time).collect::<Vec<_>>(), vec![60_000, 180_000]);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryCandleStore::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.upsert(Timeframe::M1, &minute_candle("BTCUSDT", 0)).await,
            Err(StorageError::Unavailable(_))
        ));
        assert!(!store.ping().await);
        store.set_unavailable(false);
        assert!(store.ping().await);
    }
}
