//! Derived candles rebuilt from stored base rows.
//!
//! A derived candle is written only when the base table holds every base
//! bucket of its window; a short window yields nothing.

use std::sync::Arc;

use tracing::debug;

use crate::candle::Candle;
use crate::errors::StorageError;
use crate::store::CandleStore;
use crate::timeframe::Timeframe;

pub struct CandleRebuilder {
    store: Arc<dyn CandleStore>,
    base: Timeframe,
}

impl CandleRebuilder {
    pub fn new(store: Arc<dyn CandleStore>, base: Timeframe) -> Self {
        Self { store, base }
    }

    /// Fold the stored base rows of the `timeframe` window opening at
    /// `bucket_open`. `None` unless every base bucket is present and closed.
    pub async fn build(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bucket_open: i64,
    ) -> Result<Option<Candle>, StorageError> {
        let needed = (timeframe.duration_ms() / self.base.duration_ms()) as usize;
        let rows = self
            .store
            .range_query(symbol, self.base, bucket_open, timeframe.close_time(bucket_open))
            .await?;

        if rows.len() != needed || rows.iter().any(|c| !c.is_closed) {
            debug!(
                symbol,
                timeframe = %timeframe,
                bucket_open,
                have = rows.len(),
                needed,
                "Base window incomplete, not rebuilding"
            );
            return Ok(None);
        }

        let mut rows = rows.into_iter();
        let Some(first) = rows.next() else {
            return Ok(None);
        };
        let mut candle = Candle::seed_bucket(&first, timeframe, bucket_open);
        for row in rows {
            candle.absorb(&row);
        }
        candle.is_closed = true;
        Ok(Some(candle))
    }

    /// `build`, then upsert the result. Returns whether a candle was written.
    pub async fn rebuild(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        bucket_open: i64,
    ) -> Result<bool, StorageError> {
        match self.build(symbol, timeframe, bucket_open).await? {
            Some(candle) => {
                self.store.upsert(timeframe, &candle).await?;
                debug!(symbol, timeframe = %timeframe, bucket_open, "Derived candle rebuilt from base rows");
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Open time of the newest `timeframe` window that ends at or before the
    /// base bucket `last_base_open`.
    pub fn trailing_window(&self, timeframe: Timeframe, last_base_open: i64) -> i64 {
        timeframe.bucket_open(last_base_open + self.base.duration_ms()) - timeframe.duration_ms()
    }
}
