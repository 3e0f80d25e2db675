//! Derives higher-timeframe candles from closed base-timeframe candles.
//!
//! One bucket per (derived timeframe, symbol). A bucket is finalized only
//! when a base candle from a later window arrives for the same symbol, so the
//! newest bucket of every pair always stays in memory. It is lost if the
//! process stops; the REST reconciliation path repairs that window later.
//!
//! Input is assumed to be ordered by open time per symbol. An older candle
//! still triggers finalization of the current bucket; nothing is reordered.
//!
//! A finalized bucket is `complete` only when it was seeded at its window
//! start and absorbed every base candle of the window in sequence. The first
//! bucket after startup, or after a symbol is first subscribed, is seeded
//! mid-window and comes out incomplete; the caller rebuilds those from
//! stored base rows instead of persisting them.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::candle::Candle;
use crate::timeframe::Timeframe;

/// A bucket flushed by a later base candle.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    pub candle: Candle,
    /// Every base candle of the window was absorbed, in order.
    pub complete: bool,
}

struct Bucket {
    candle: Candle,
    parts: i64,
    last_part: i64,
    contiguous: bool,
}

impl Bucket {
    fn seed(base: &Candle, timeframe: Timeframe, bucket_open: i64) -> Self {
        Self {
            candle: Candle::seed_bucket(base, timeframe, bucket_open),
            parts: 1,
            last_part: base.open_time,
            contiguous: base.open_time == bucket_open,
        }
    }

    fn absorb(&mut self, sub: &Candle, step: i64) {
        self.contiguous &= sub.open_time == self.last_part + step;
        self.candle.absorb(sub);
        self.parts += 1;
        self.last_part = sub.open_time;
    }

    fn finish(self, needed: i64) -> Finalized {
        let mut candle = self.candle;
        candle.is_closed = true;
        Finalized {
            candle,
            complete: self.contiguous && self.parts == needed,
        }
    }
}

pub struct Aggregator {
    base: Timeframe,
    targets: Vec<Timeframe>,
    buckets: HashMap<(Timeframe, String), Bucket>,
}

impl Aggregator {
    /// Build an aggregator for `targets`; timeframes that are not whole
    /// multiples of `base` are ignored.
    pub fn new(base: Timeframe, targets: impl IntoIterator<Item = Timeframe>) -> Self {
        let mut targets: Vec<Timeframe> = targets
            .into_iter()
            .filter(|tf| {
                let ok = tf.is_multiple_of(base);
                if !ok {
                    warn!(timeframe = %tf, base = %base, "Skipping timeframe that cannot be derived from base");
                }
                ok
            })
            .collect();
        targets.sort();
        targets.dedup();

        Self {
            base,
            targets,
            buckets: HashMap::new(),
        }
    }

    pub fn base(&self) -> Timeframe {
        self.base
    }

    pub fn targets(&self) -> &[Timeframe] {
        &self.targets
    }

    /// Feed one closed base candle; returns the buckets it finalized.
    pub fn push(&mut self, candle: &Candle) -> Vec<Finalized> {
        if candle.timeframe != self.base || !candle.is_closed {
            debug!(
                symbol = %candle.symbol,
                timeframe = %candle.timeframe,
                "Aggregator ignoring non-base or open candle"
            );
            return Vec::new();
        }

        let step = self.base.duration_ms();
        let mut finalized = Vec::new();

        for &tf in &self.targets {
            let bucket_open = tf.bucket_open(candle.open_time);
            let key = (tf, candle.symbol.clone());

            match self.buckets.get_mut(&key) {
                Some(bucket) if bucket.candle.open_time == bucket_open => bucket.absorb(candle, step),
                Some(bucket) => {
                    if bucket_open < bucket.candle.open_time {
                        warn!(
                            symbol = %candle.symbol,
                            timeframe = %tf,
                            bucket_open = bucket.candle.open_time,
                            candle_open = candle.open_time,
                            "Out-of-order base candle finalizes current bucket early"
                        );
                    }
                    let done = std::mem::replace(bucket, Bucket::seed(candle, tf, bucket_open));
                    finalized.push(done.finish(tf.duration_ms() / step));
                }
                None => {
                    self.buckets.insert(key, Bucket::seed(candle, tf, bucket_open));
                }
            }
        }

        finalized
    }

    /// The in-flight bucket for (timeframe, symbol), if any.
    pub fn pending(&self, timeframe: Timeframe, symbol: &str) -> Option<&Candle> {
        self.buckets
            .get(&(timeframe, symbol.to_string()))
            .map(|bucket| &bucket.candle)
    }

    pub fn pending_count(&self) -> usize {
        self.buckets.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::fixtures::minute_candle;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn varied(symbol: &str, minute: i64) -> Candle {
        let mut c = minute_candle(symbol, minute);
        let m = Decimal::from(minute);
        c.open = dec!(100) + m;
        c.close = dec!(100.5) + m;
        c.high = dec!(102) + m;
        c.low = dec!(99) + m;
        c.base_volume = Decimal::from(minute + 1);
        c.trade_count = minute + 1;
        c
    }

    #[test]
    fn test_sixteen_minutes_emit_one_quarter_hour() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M15]);
        let mut out = Vec::new();
        for minute in 0..16 {
            out.extend(agg.push(&varied("BTCUSDT", minute)));
        }

        assert_eq!(out.len(), 1);
        assert!(out[0].complete);
        let c = &out[0].candle;
        assert_eq!(c.timeframe, Timeframe::M15);
        assert_eq!(c.open_time, 0);
        assert_eq!(c.close_time, 14 * 60_000 + 59_999);
        assert_eq!(c.open, dec!(100));
        assert_eq!(c.close, dec!(114.5));
        assert_eq!(c.high, dec!(116));
        assert_eq!(c.low, dec!(99));
        // 1 + 2 + ... + 15
        assert_eq!(c.base_volume, Decimal::from(120));
        assert_eq!(c.trade_count, 120);
        assert!(c.is_closed);

        // the 16th minute seeds an unflushed bucket
        let pending = agg.pending(Timeframe::M15, "BTCUSDT").unwrap();
        assert_eq!(pending.open_time, 15 * 60_000);
        assert_eq!(pending.open, dec!(115));
        assert!(!pending.is_closed);
    }

    #[test]
    fn test_k_windows_plus_partial() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M5, Timeframe::M15]);
        let mut out = Vec::new();
        // three full quarter hours plus seven minutes
        for minute in 0..52 {
            out.extend(agg.push(&varied("ETHUSDT", minute)));
        }

        assert!(out.iter().all(|f| f.complete));
        let candles: Vec<Candle> = out.into_iter().map(|f| f.candle).collect();
        let fives: Vec<_> = candles.iter().filter(|c| c.timeframe == Timeframe::M5).collect();
        let quarters: Vec<_> = candles.iter().filter(|c| c.timeframe == Timeframe::M15).collect();
        assert_eq!(fives.len(), 10);
        assert_eq!(quarters.len(), 3);
        for (i, q) in quarters.iter().enumerate() {
            let first = i as i64 * 15;
            assert_eq!(q.open_time, first * 60_000);
            assert_eq!(q.open, dec!(100) + Decimal::from(first));
            assert_eq!(q.close, dec!(100.5) + Decimal::from(first + 14));
        }
        assert_eq!(agg.pending_count(), 2);
    }

    #[test]
    fn test_symbols_are_independent() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M15]);
        for minute in 0..15 {
            assert!(agg.push(&varied("BTCUSDT", minute)).is_empty());
        }
        // a new window for another symbol does not finalize BTCUSDT
        assert!(agg.push(&varied("ETHUSDT", 15)).is_empty());
        assert!(agg.push(&varied("ETHUSDT", 30)).len() == 1);
        assert_eq!(agg.pending(Timeframe::M15, "BTCUSDT").unwrap().open_time, 0);
    }

    #[test]
    fn test_gap_finalizes_partial_window() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M15]);
        agg.push(&varied("BTCUSDT", 0));
        agg.push(&varied("BTCUSDT", 1));
        let out = agg.push(&varied("BTCUSDT", 40));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].candle.trade_count, 3);
        assert!(!out[0].complete);
        assert_eq!(agg.pending(Timeframe::M15, "BTCUSDT").unwrap().open_time, 30 * 60_000);
    }

    #[test]
    fn test_window_seeded_mid_way_is_incomplete() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M15]);
        // started at 00:07: the 00:00 window only sees 8 of its 15 minutes
        let mut out = Vec::new();
        for minute in 7..=15 {
            out.extend(agg.push(&varied("BTCUSDT", minute)));
        }
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].candle.open_time, 0);
        assert_eq!(out[0].candle.open, dec!(107));
        assert!(!out[0].complete);

        // the next window is seeded at its start and comes out complete
        for minute in 16..=30 {
            out.extend(agg.push(&varied("BTCUSDT", minute)));
        }
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].candle.open_time, 15 * 60_000);
        assert!(out[1].complete);
    }

    #[test]
    fn test_missing_minute_is_incomplete() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M5]);
        for minute in [0, 1, 3, 4] {
            agg.push(&varied("BTCUSDT", minute));
        }
        let out = agg.push(&varied("BTCUSDT", 5));
        assert_eq!(out.len(), 1);
        assert!(!out[0].complete);
    }

    #[test]
    fn test_out_of_order_finalizes_early() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M15]);
        agg.push(&varied("BTCUSDT", 20));
        let out = agg.push(&varied("BTCUSDT", 3));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].candle.open_time, 15 * 60_000);
        assert!(!out[0].complete);
        assert_eq!(agg.pending(Timeframe::M15, "BTCUSDT").unwrap().open_time, 0);
    }

    #[test]
    fn test_ignores_non_base_and_open_candles() {
        let mut agg = Aggregator::new(Timeframe::M1, [Timeframe::M15]);
        let mut c = varied("BTCUSDT", 0);
        c.timeframe = Timeframe::M5;
        assert!(agg.push(&c).is_empty());

        let mut open = varied("BTCUSDT", 0);
        open.is_closed = false;
        assert!(agg.push(&open).is_empty());
        assert_eq!(agg.pending_count(), 0);
    }

    #[test]
    fn test_underivable_targets_are_dropped() {
        let agg = Aggregator::new(Timeframe::M3, [Timeframe::M5, Timeframe::M15, Timeframe::M3]);
        assert_eq!(agg.targets(), &[Timeframe::M15]);
    }
}
