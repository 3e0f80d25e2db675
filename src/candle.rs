//! Canonical candle record shared by the stream, REST and storage paths.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;
use crate::timeframe::Timeframe;

/// One OHLCV record for one symbol, one timeframe and one bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub timeframe: Timeframe,
    /// Bucket-aligned open time (epoch ms)
    pub open_time: i64,
    /// Last millisecond of the bucket (epoch ms)
    pub close_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub base_volume: Decimal,
    pub quote_volume: Decimal,
    pub taker_buy_base_volume: Decimal,
    pub taker_buy_quote_volume: Decimal,
    pub trade_count: i64,
    pub is_closed: bool,
    /// Exchange event time for stream-sourced rows, None for REST rows
    pub event_time: Option<i64>,
    pub first_trade_id: Option<i64>,
    pub last_trade_id: Option<i64>,
    pub open_interest: Option<Decimal>,
    pub funding_rate: Option<Decimal>,
}

impl Candle {
    /// Check `low <= open, close <= high` and that the bucket is not empty.
    pub fn validate(&self) -> Result<(), DecodeError> {
        let in_bounds = self.low <= self.open
            && self.low <= self.close
            && self.open <= self.high
            && self.close <= self.high;

        if !in_bounds || self.close_time <= self.open_time {
            return Err(DecodeError::Bounds {
                symbol: self.symbol.clone(),
                open_time: self.open_time,
            });
        }
        Ok(())
    }

    /// Start a derived-timeframe candle seeded entirely from `base`.
    pub(crate) fn seed_bucket(base: &Candle, timeframe: Timeframe, bucket_open: i64) -> Self {
        Self {
            symbol: base.symbol.clone(),
            timeframe,
            open_time: bucket_open,
            close_time: timeframe.close_time(bucket_open),
            open: base.open,
            high: base.high,
            low: base.low,
            close: base.close,
            base_volume: base.base_volume,
            quote_volume: base.quote_volume,
            taker_buy_base_volume: base.taker_buy_base_volume,
            taker_buy_quote_volume: base.taker_buy_quote_volume,
            trade_count: base.trade_count,
            is_closed: false,
            event_time: base.event_time,
            first_trade_id: base.first_trade_id,
            last_trade_id: base.last_trade_id,
            open_interest: None,
            funding_rate: None,
        }
    }

    /// Fold one more sub-candle of the same window into this bucket.
    pub(crate) fn absorb(&mut self, sub: &Candle) {
        self.high = self.high.max(sub.high);
        self.low = self.low.min(sub.low);
        self.close = sub.close;
        self.base_volume += sub.base_volume;
        self.quote_volume += sub.quote_volume;
        self.taker_buy_base_volume += sub.taker_buy_base_volume;
        self.taker_buy_quote_volume += sub.taker_buy_quote_volume;
        self.trade_count += sub.trade_count;
        self.event_time = sub.event_time.or(self.event_time);
        if sub.last_trade_id.is_some() {
            self.last_trade_id = sub.last_trade_id;
        }
    }
}
