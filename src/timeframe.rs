//! Kline intervals supported by the exchange.
//!
//! Every per-timeframe decision (table name, wire label, bucket width) is a
//! `match` over this enum, so adding an interval is a compile-time change.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::DecodeError;

const MINUTE_MS: i64 = 60_000;

/// Bucket duration of a candle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Timeframe {
    M1,
    M3,
    M5,
    M15,
    M30,
    H1,
    H2,
    H4,
    H6,
    H8,
    H12,
    D1,
}

impl Timeframe {
    pub const ALL: [Timeframe; 12] = [
        Timeframe::M1,
        Timeframe::M3,
        Timeframe::M5,
        Timeframe::M15,
        Timeframe::M30,
        Timeframe::H1,
        Timeframe::H2,
        Timeframe::H4,
        Timeframe::H6,
        Timeframe::H8,
        Timeframe::H12,
        Timeframe::D1,
    ];

    /// Wire label used by both the stream and REST APIs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M3 => "3m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H2 => "2h",
            Timeframe::H4 => "4h",
            Timeframe::H6 => "6h",
            Timeframe::H8 => "8h",
            Timeframe::H12 => "12h",
            Timeframe::D1 => "1d",
        }
    }

    pub const fn duration_ms(self) -> i64 {
        match self {
            Timeframe::M1 => MINUTE_MS,
            Timeframe::M3 => 3 * MINUTE_MS,
            Timeframe::M5 => 5 * MINUTE_MS,
            Timeframe::M15 => 15 * MINUTE_MS,
            Timeframe::M30 => 30 * MINUTE_MS,
            Timeframe::H1 => 60 * MINUTE_MS,
            Timeframe::H2 => 120 * MINUTE_MS,
            Timeframe::H4 => 240 * MINUTE_MS,
            Timeframe::H6 => 360 * MINUTE_MS,
            Timeframe::H8 => 480 * MINUTE_MS,
            Timeframe::H12 => 720 * MINUTE_MS,
            Timeframe::D1 => 1440 * MINUTE_MS,
        }
    }

    /// Storage table holding candles of this timeframe.
    pub const fn table(self) -> &'static str {
        match self {
            Timeframe::M1 => "candles_1m",
            Timeframe::M3 => "candles_3m",
            Timeframe::M5 => "candles_5m",
            Timeframe::M15 => "candles_15m",
            Timeframe::M30 => "candles_30m",
            Timeframe::H1 => "candles_1h",
            Timeframe::H2 => "candles_2h",
            Timeframe::H4 => "candles_4h",
            Timeframe::H6 => "candles_6h",
            Timeframe::H8 => "candles_8h",
            Timeframe::H12 => "candles_12h",
            Timeframe::D1 => "candles_1d",
        }
    }

    /// Start of the bucket containing `ts_ms`.
    pub fn bucket_open(self, ts_ms: i64) -> i64 {
        ts_ms.div_euclid(self.duration_ms()) * self.duration_ms()
    }

    /// Last millisecond of the bucket starting at `open_time`.
    pub fn close_time(self, open_time: i64) -> i64 {
        open_time + self.duration_ms() - 1
    }

    /// Open time of the most recent bucket that is fully closed at `now_ms`.
    pub fn expected_last_closed(self, now_ms: i64) -> i64 {
        self.bucket_open(now_ms) - self.duration_ms()
    }

    /// Stream name for this interval, e.g. `btcusdt@kline_1m`.
    pub fn stream_name(self, symbol: &str) -> String {
        format!("{}@kline_{}", symbol.to_lowercase(), self.as_str())
    }

    /// Whether buckets of `self` are whole multiples of `base` buckets.
    pub fn is_multiple_of(self, base: Timeframe) -> bool {
        self.duration_ms() > base.duration_ms() && self.duration_ms() % base.duration_ms() == 0
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| DecodeError::Interval(s.to_string()))
    }
}
