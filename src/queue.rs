//! Bounded hand-off between the stream task and the persistence worker.
//!
//! The producer side never waits: when the queue is full the newest item is
//! dropped and counted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::warn;

use crate::candle::Candle;
use crate::timeframe::Timeframe;

/// One queued candle together with the timeframe it belongs to.
pub type QueuedCandle = (Timeframe, Candle);

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

/// Producer half, cheap to clone.
#[derive(Debug, Clone)]
pub struct IngestSender {
    tx: mpsc::Sender<QueuedCandle>,
    counters: Arc<QueueCounters>,
}

/// Consumer half, owned by the persistence worker.
#[derive(Debug)]
pub struct IngestReceiver {
    rx: mpsc::Receiver<QueuedCandle>,
    counters: Arc<QueueCounters>,
}

/// Read-only view of queue counters for health reporting.
#[derive(Debug, Clone)]
pub struct QueueStats {
    counters: Arc<QueueCounters>,
}

/// Result of a bounded wait on the queue.
#[derive(Debug)]
pub enum Recv {
    Item(QueuedCandle),
    Timeout,
    Closed,
}

/// Create a queue with room for `capacity` items.
pub fn ingest_queue(capacity: usize) -> (IngestSender, IngestReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let counters = Arc::new(QueueCounters::default());
    (
        IngestSender {
            tx,
            counters: counters.clone(),
        },
        IngestReceiver { rx, counters },
    )
}

impl IngestSender {
    /// Enqueue without blocking. Returns false if the item was dropped.
    pub fn try_put(&self, timeframe: Timeframe, candle: Candle) -> bool {
        match self.tx.try_send((timeframe, candle)) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full((tf, c))) => {
                let dropped = self.counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    symbol = %c.symbol,
                    timeframe = %tf,
                    open_time = c.open_time,
                    dropped,
                    "Ingest queue full, dropping candle"
                );
                false
            }
            Err(TrySendError::Closed((tf, c))) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(symbol = %c.symbol, timeframe = %tf, "Ingest queue closed, dropping candle");
                false
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            counters: self.counters.clone(),
        }
    }
}

impl IngestReceiver {
    /// Wait at most `timeout` for the next item.
    pub async fn get_with_timeout(&mut self, timeout: Duration) -> Recv {
        match tokio::time::timeout(timeout, self.rx.recv()).await {
            Ok(Some(item)) => {
                self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
                Recv::Item(item)
            }
            Ok(None) => Recv::Closed,
            Err(_) => Recv::Timeout,
        }
    }

    /// Number of items currently waiting.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            counters: self.counters.clone(),
        }
    }
}

impl QueueStats {
    pub fn enqueued(&self) -> u64 {
        self.counters.enqueued.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    /// Items enqueued but not yet taken by the consumer.
    pub fn depth(&self) -> u64 {
        self.enqueued()
            .saturating_sub(self.counters.dequeued.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candle::fixtures::minute_candle;

    #[tokio::test]
    async fn test_full_queue_drops_newest() {
        let (tx, mut rx) = ingest_queue(2);

        assert!(tx.try_put(Timeframe::M1, minute_candle("BTCUSDT", 0)));
        assert!(tx.try_put(Timeframe::M1, minute_candle("BTCUSDT", 1)));
        // third put returns immediately instead of waiting for room
        assert!(!tx.try_put(Timeframe::M1, minute_candle("BTCUSDT", 2)));

        let stats = tx.stats();
        assert_eq!(stats.enqueued(), 2);
        assert_eq!(stats.dropped(), 1);
        assert_eq!(stats.depth(), 2);

        // the survivors are the two oldest items, in order
        for minute in 0..2 {
            match rx.get_with_timeout(Duration::from_millis(50)).await {
                Recv::Item((_, c)) => assert_eq!(c.open_time, minute * 60_000),
                other => panic!("expected item, got {:?}", other),
            }
        }
        assert_eq!(stats.depth(), 0);
    }

    #[tokio::test]
    async fn test_get_times_out_on_empty_queue() {
        let (_tx, mut rx) = ingest_queue(4);
        assert!(matches!(
            rx.get_with_timeout(Duration::from_millis(10)).await,
            Recv::Timeout
        ));
    }

    #[tokio::test]
    async fn test_closed_when_all_senders_dropped() {
        let (tx, mut rx) = ingest_queue(4);
        drop(tx);
        assert!(matches!(
            rx.get_with_timeout(Duration::from_millis(10)).await,
            Recv::Closed
        ));
    }
}
