//! Error types for the candle feeder.
//!
//! Each failure domain gets its own enum so callers can decide policy per
//! domain: decode errors drop one record, storage errors abort one batch,
//! fetch errors end one backfill, and only configuration errors are fatal.

use thiserror::Error;

use crate::timeframe::Timeframe;

/// Top-level error type for the service.
#[derive(Error, Debug)]
pub enum FeederError {
    /// WebSocket connection errors
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// The WebSocket handshake did not finish in time
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(std::time::Duration),

    /// No pong arrived within the configured timeout
    #[error("Heartbeat timeout: no pong for {0:?}")]
    HeartbeatTimeout(std::time::Duration),

    /// Storage failures
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// REST failures
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Symbol source failures
    #[error(transparent)]
    Symbols(#[from] SymbolSourceError),

    /// Wire decode failures
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// URL parsing errors
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

impl FeederError {
    /// Create a configuration error with a message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

/// Result type alias using FeederError.
pub type Result<T> = std::result::Result<T, FeederError>;

/// A stream or REST record that could not be turned into a candle.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported interval '{0}'")]
    Interval(String),

    #[error("field '{field}' is not a valid number: {value}")]
    Number { field: &'static str, value: String },

    #[error("field '{0}' is missing")]
    Missing(&'static str),

    #[error("candle {symbol} @ {open_time} violates OHLC bounds")]
    Bounds { symbol: String, open_time: i64 },
}

impl DecodeError {
    pub(crate) fn number(field: &'static str, value: impl ToString) -> Self {
        Self::Number {
            field,
            value: value.to_string(),
        }
    }
}

/// Upsert or query failure against the candle store.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("Database pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("Timeframe {0} has no table in this store")]
    UnknownTimeframe(Timeframe),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// REST history call failure.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected response: {0}")]
    Response(String),

    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),
}

/// Failure of one backfill invocation.
#[derive(Error, Debug)]
pub enum BackfillError {
    /// The pagination cursor failed to move in the expected direction.
    #[error("backfill stalled for {symbol} {timeframe}: cursor {previous} -> {next}")]
    Stall {
        symbol: String,
        timeframe: Timeframe,
        previous: i64,
        next: i64,
    },

    #[error("backfill aborted: {0}")]
    Storage(#[from] StorageError),
}

/// Failure reading the desired symbol list.
#[derive(Error, Debug)]
pub enum SymbolSourceError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Symbol payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Symbol payload has unexpected shape: {0}")]
    Shape(String),
}
