//! Live kline stream.
//!
//! This module handles:
//! - The WebSocket session and its reconnect loop
//! - Minimal SUBSCRIBE/UNSUBSCRIBE deltas as the symbol list changes;
//!   symbols in a rejected SUBSCRIBE are dropped from the applied set so
//!   the next diff asks for them again
//! - Ping/pong keepalive with a pong deadline
//! - Forwarding closed candles to the ingest queue without blocking

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::{interval_at, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;
use crate::decoder::{decode_stream_message, StreamEvent};
use crate::errors::{FeederError, Result, SymbolSourceError};
use crate::queue::IngestSender;
use crate::symbols::SymbolSource;
use crate::timeframe::Timeframe;

/// Streams per SUBSCRIBE/UNSUBSCRIBE request.
const MAX_STREAMS_PER_REQUEST: usize = 200;

/// Symbols currently subscribed on the live connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionSet {
    symbols: BTreeSet<String>,
}

/// Changes needed to move a `SubscriptionSet` to a desired set.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionDelta {
    pub subscribe: Vec<String>,
    pub unsubscribe: Vec<String>,
}

impl SubscriptionDelta {
    pub fn is_empty(&self) -> bool {
        self.subscribe.is_empty() && self.unsubscribe.is_empty()
    }
}

impl SubscriptionSet {
    /// `subscribe = desired \ current`, `unsubscribe = current \ desired`.
    pub fn diff(&self, desired: &BTreeSet<String>) -> SubscriptionDelta {
        SubscriptionDelta {
            subscribe: desired.difference(&self.symbols).cloned().collect(),
            unsubscribe: self.symbols.difference(desired).cloned().collect(),
        }
    }

    pub fn apply(&mut self, delta: &SubscriptionDelta) {
        for symbol in &delta.unsubscribe {
            self.symbols.remove(symbol);
        }
        self.symbols.extend(delta.subscribe.iter().cloned());
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Drop symbols the server refused.
    pub fn forget(&mut self, symbols: &[String]) {
        for symbol in symbols {
            self.symbols.remove(symbol);
        }
    }
}

#[derive(Debug, Serialize)]
struct ControlRequest<'a> {
    method: &'a str,
    params: &'a [String],
    id: u64,
}

/// Connection state, visible to the health endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Counters shared between the connector and health reporting.
#[derive(Debug)]
pub struct StreamStats {
    state: RwLock<ConnectionState>,
    received: AtomicU64,
    forwarded: AtomicU64,
    decode_errors: AtomicU64,
    reconnects: AtomicU64,
    subscribed: AtomicUsize,
    last_open_time: AtomicU64,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self {
            state: RwLock::new(ConnectionState::Disconnected),
            received: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            subscribed: AtomicUsize::new(0),
            last_open_time: AtomicU64::new(0),
        }
    }
}

impl StreamStats {
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Closed candles decoded from the stream.
    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }

    /// Closed candles accepted by the ingest queue.
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    pub fn reconnects(&self) -> u64 {
        self.reconnects.load(Ordering::Relaxed)
    }

    pub fn subscribed(&self) -> usize {
        self.subscribed.load(Ordering::Relaxed)
    }

    /// Open time of the newest closed candle seen, if any.
    pub fn last_open_time(&self) -> Option<i64> {
        match self.last_open_time.load(Ordering::Relaxed) {
            0 => None,
            t => Some(t as i64),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }
}

/// Polls the symbol source and publishes the desired set.
pub struct SymbolWatcher {
    source: Arc<dyn SymbolSource>,
    interval: Duration,
    tx: watch::Sender<BTreeSet<String>>,
}

impl SymbolWatcher {
    pub fn new(
        source: Arc<dyn SymbolSource>,
        interval: Duration,
    ) -> (Self, watch::Receiver<BTreeSet<String>>) {
        let (tx, rx) = watch::channel(BTreeSet::new());
        (
            Self {
                source,
                interval,
                tx,
            },
            rx,
        )
    }

    /// Re-read the source once. Returns whether the published set changed.
    pub async fn refresh(&self) -> std::result::Result<bool, SymbolSourceError> {
        let latest: BTreeSet<String> = self.source.symbols().await?.into_iter().collect();

        let changed = self.tx.send_if_modified(|current| {
            if *current == latest {
                return false;
            }
            *current = latest.clone();
            true
        });

        if changed {
            info!(symbols = latest.len(), "Desired symbol set changed");
        }
        Ok(changed)
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "Symbol refresh failed, keeping previous set");
                    }
                }
            }
        }

        debug!("Symbol watcher stopped");
    }
}

/// Owns the WebSocket and keeps it subscribed to the desired symbols.
pub struct StreamConnector {
    config: StreamConfig,
    timeframe: Timeframe,
    source: Arc<dyn SymbolSource>,
    desired: watch::Receiver<BTreeSet<String>>,
    queue: IngestSender,
    stats: Arc<StreamStats>,
    next_id: AtomicU64,
    /// Symbols of SUBSCRIBE requests still waiting for an ack, by id
    pending: Mutex<HashMap<u64, Vec<String>>>,
    watcher_alive: AtomicBool,
}

impl StreamConnector {
    pub fn new(
        config: StreamConfig,
        timeframe: Timeframe,
        source: Arc<dyn SymbolSource>,
        desired: watch::Receiver<BTreeSet<String>>,
        queue: IngestSender,
    ) -> Self {
        Self {
            config,
            timeframe,
            source,
            desired,
            queue,
            stats: Arc::new(StreamStats::default()),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            watcher_alive: AtomicBool::new(true),
        }
    }

    pub fn stats(&self) -> Arc<StreamStats> {
        self.stats.clone()
    }

    /// Connect, stream, and reconnect after a fixed delay until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            self.stats.set_state(ConnectionState::Connecting);
            match self.session(&cancel).await {
                Ok(()) => info!("WebSocket session ended"),
                Err(e) => error!(error = %e, "WebSocket session failed"),
            }
            self.stats.set_state(ConnectionState::Disconnected);
            self.stats.subscribed.store(0, Ordering::Relaxed);

            if cancel.is_cancelled() {
                break;
            }

            self.stats.reconnects.fetch_add(1, Ordering::Relaxed);
            warn!(delay = ?self.config.reconnect_delay, "Reconnecting");
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.reconnect_delay) => {}
            }
        }

        info!("Stream connector stopped");
    }

    /// One connection from connect to close. Subscriptions start empty on
    /// every session.
    async fn session(&self, cancel: &CancellationToken) -> Result<()> {
        info!(url = %self.config.url, "Connecting to kline stream");

        let connect = tokio::time::timeout(
            self.config.connect_timeout,
            connect_async(self.config.url.as_str()),
        );
        let (ws_stream, response) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            connected = connect => match connected {
                Ok(result) => result?,
                Err(_) => return Err(FeederError::ConnectTimeout(self.config.connect_timeout)),
            },
        };
        info!(status = %response.status(), "WebSocket connected");
        self.stats.set_state(ConnectionState::Connected);

        let (mut write, mut read) = ws_stream.split();
        let mut subscriptions = SubscriptionSet::default();
        self.pending.lock().clear();

        let mut desired_rx = self.desired.clone();
        let watched = desired_rx.borrow_and_update().clone();
        let initial: BTreeSet<String> = match self.source.symbols().await {
            Ok(symbols) => symbols.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Symbol source unavailable on connect, using last known set");
                watched
            }
        };
        let delta = subscriptions.diff(&initial);
        self.send_delta(&mut write, &mut subscriptions, delta).await?;

        let mut ping = interval_at(
            Instant::now() + self.config.ping_interval,
            self.config.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let watcher_alive = self.watcher_alive.load(Ordering::Relaxed);

            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Closing WebSocket on shutdown");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }

                changed = desired_rx.changed(), if watcher_alive => {
                    if changed.is_err() {
                        warn!("Symbol watcher gone, subscriptions frozen");
                        self.watcher_alive.store(false, Ordering::Relaxed);
                        continue;
                    }
                    let desired = desired_rx.borrow_and_update().clone();
                    let delta = subscriptions.diff(&desired);
                    if !delta.is_empty() {
                        self.send_delta(&mut write, &mut subscriptions, delta).await?;
                    }
                }

                _ = ping.tick() => {
                    if pong_deadline.is_none() {
                        write.send(Message::Ping(Vec::new())).await?;
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout);
                    }
                }

                _ = sleep_until(pong_deadline.unwrap_or_else(Instant::now)), if pong_deadline.is_some() => {
                    return Err(FeederError::HeartbeatTimeout(self.config.pong_timeout));
                }

                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let rejected = self.handle_text(&text);
                        if !rejected.is_empty() {
                            subscriptions.forget(&rejected);
                            self.stats
                                .subscribed
                                .store(subscriptions.len(), Ordering::Relaxed);
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(frame = ?frame, "WebSocket closed by server");
                        return Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Ok(()),
                },
            }
        }
    }

    async fn send_delta<S>(
        &self,
        write: &mut S,
        subscriptions: &mut SubscriptionSet,
        delta: SubscriptionDelta,
    ) -> Result<()>
    where
        S: Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        for text in self.control_messages("UNSUBSCRIBE", &delta.unsubscribe)? {
            write.send(Message::Text(text)).await?;
        }
        for text in self.control_messages("SUBSCRIBE", &delta.subscribe)? {
            write.send(Message::Text(text)).await?;
        }

        subscriptions.apply(&delta);
        self.stats
            .subscribed
            .store(subscriptions.len(), Ordering::Relaxed);

        if !delta.is_empty() {
            info!(
                subscribed = delta.subscribe.len(),
                unsubscribed = delta.unsubscribe.len(),
                total = subscriptions.len(),
                "Subscription delta applied"
            );
        }
        Ok(())
    }

    /// Control frames for `symbols`, split into bounded requests with
    /// increasing ids. Empty when `symbols` is empty. SUBSCRIBE requests
    /// are remembered until acked.
    fn control_messages(&self, method: &str, symbols: &[String]) -> Result<Vec<String>> {
        symbols
            .chunks(MAX_STREAMS_PER_REQUEST)
            .map(|chunk| -> Result<String> {
                let streams: Vec<String> = chunk
                    .iter()
                    .map(|s| self.timeframe.stream_name(s))
                    .collect();
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let text = serde_json::to_string(&ControlRequest {
                    method,
                    params: &streams,
                    id,
                })?;
                if method == "SUBSCRIBE" {
                    self.pending.lock().insert(id, chunk.to_vec());
                }
                Ok(text)
            })
            .collect()
    }

    /// Handle one text frame. Returns the symbols of a rejected SUBSCRIBE.
    pub(crate) fn handle_text(&self, text: &str) -> Vec<String> {
        match decode_stream_message(text) {
            Ok(StreamEvent::Closed(candle)) => {
                self.stats.received.fetch_add(1, Ordering::Relaxed);
                self.stats
                    .last_open_time
                    .fetch_max(candle.open_time.max(0) as u64, Ordering::Relaxed);
                debug!(
                    symbol = %candle.symbol,
                    timeframe = %candle.timeframe,
                    open_time = candle.open_time,
                    close = %candle.close,
                    "Closed candle"
                );
                if self.queue.try_put(candle.timeframe, candle) {
                    self.stats.forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            Ok(StreamEvent::Open { .. }) => {}
            Ok(StreamEvent::Ack { id, error: Some(e) }) => {
                let rejected = self.pending.lock().remove(&id).unwrap_or_default();
                warn!(id, error = %e, symbols = ?rejected, "Subscription request rejected");
                return rejected;
            }
            Ok(StreamEvent::Ack { id, error: None }) => {
                self.pending.lock().remove(&id);
                debug!(id, "Subscription request acknowledged");
            }
            Ok(StreamEvent::Ignored) => {}
            Err(e) => {
                self.stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping undecodable stream message");
            }
        }
        Vec::new()
    }
}
