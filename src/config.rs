//! Configuration module for the candle feeder.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::collections::BTreeSet;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{FeederError, Result};
use crate::timeframe::Timeframe;

/// Exchange cap on klines per REST page.
pub const MAX_PAGE_LIMIT: usize = 1500;

/// Main configuration struct for the feeder.
#[derive(Debug, Clone)]
pub struct Config {
    pub stream: StreamConfig,
    pub rest: RestConfig,
    pub database: DatabaseConfig,
    pub store_backend: StoreBackend,
    pub symbols: SymbolConfig,
    pub timeframes: TimeframePlan,
    pub ingest: IngestConfig,
    pub backfill: BackfillConfig,
    pub watchdog: WatchdogConfig,

    /// Health check HTTP server port
    pub health_check_port: u16,

    /// Log level used when RUST_LOG is not set
    pub log_level: String,

    /// How long to wait for tasks after a shutdown signal
    pub shutdown_timeout: Duration,
}

/// WebSocket settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub url: String,
    /// Upper bound on the TCP/TLS/WebSocket handshake
    pub connect_timeout: Duration,
    /// Fixed wait before reconnecting
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    /// Connection is considered dead if a ping goes unanswered this long
    pub pong_timeout: Duration,
    /// How often the symbol watcher re-reads the symbol source
    pub symbol_refresh_interval: Duration,
}

/// REST history settings.
#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub timeout: Duration,
}

/// Database connection configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub pool_max: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

/// Where the desired symbol list comes from.
#[derive(Debug, Clone)]
pub struct SymbolConfig {
    pub redis_url: String,
    /// Key holding the JSON symbol list
    pub key: String,
    /// Appended to symbols that lack it (`BTC` -> `BTCUSDT`)
    pub quote_asset: String,
    /// Fixed list that replaces the Redis lookup when set
    pub static_symbols: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub queue_capacity: usize,
    /// Upper bound on how long the worker waits before re-checking shutdown
    pub poll_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    pub page_limit: usize,
    /// Pause between successive REST calls
    pub request_delay: Duration,
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub interval: Duration,
    /// Subtracted from exchange time before computing expected boundaries
    pub grace: Duration,
}

/// Which timeframes exist and how each one is sourced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeframePlan {
    /// Streamed live and the source for every derived timeframe
    pub base: Timeframe,
    /// Aggregated live from the base timeframe
    pub derived: BTreeSet<Timeframe>,
    /// Derived timeframes that are never fetched over REST
    pub memory_only: BTreeSet<Timeframe>,
    /// Sourced only from REST, never aggregated
    pub rest_only: BTreeSet<Timeframe>,
}

impl TimeframePlan {
    pub fn new(
        base: Timeframe,
        derived: impl IntoIterator<Item = Timeframe>,
        memory_only: impl IntoIterator<Item = Timeframe>,
        rest_only: impl IntoIterator<Item = Timeframe>,
    ) -> Result<Self> {
        let plan = Self {
            base,
            derived: derived.into_iter().collect(),
            memory_only: memory_only.into_iter().collect(),
            rest_only: rest_only.into_iter().collect(),
        };
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if let Some(tf) = self.derived.iter().find(|tf| !tf.is_multiple_of(self.base)) {
            return Err(FeederError::config(format!(
                "derived timeframe {} is not a multiple of base {}",
                tf, self.base
            )));
        }
        if let Some(tf) = self.memory_only.iter().find(|tf| !self.derived.contains(tf)) {
            return Err(FeederError::config(format!(
                "memory-only timeframe {} is not a derived timeframe",
                tf
            )));
        }
        if let Some(tf) = self
            .rest_only
            .iter()
            .find(|tf| **tf == self.base || self.derived.contains(tf))
        {
            return Err(FeederError::config(format!(
                "REST-only timeframe {} is already streamed or derived",
                tf
            )));
        }
        Ok(())
    }

    /// Timeframes reconciled against the REST API, shortest first.
    pub fn rest_synced(&self) -> Vec<Timeframe> {
        let mut tfs: BTreeSet<Timeframe> = self
            .derived
            .difference(&self.memory_only)
            .copied()
            .collect();
        tfs.insert(self.base);
        tfs.extend(self.rest_only.iter().copied());
        tfs.into_iter().collect()
    }

    /// Every timeframe that has a table.
    pub fn stored(&self) -> Vec<Timeframe> {
        let mut tfs: BTreeSet<Timeframe> = self.derived.union(&self.rest_only).copied().collect();
        tfs.insert(self.base);
        tfs.into_iter().collect()
    }
}

impl Default for TimeframePlan {
    fn default() -> Self {
        Self {
            base: Timeframe::M1,
            derived: [Timeframe::M15, Timeframe::H1, Timeframe::H4, Timeframe::D1].into(),
            memory_only: BTreeSet::new(),
            rest_only: BTreeSet::new(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "wss://fstream.binance.com/ws".to_string(),
            connect_timeout: Duration::from_secs(10),
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            symbol_refresh_interval: Duration::from_secs(15),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            page_limit: 500,
            request_delay: Duration::from_millis(120),
        }
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let store_backend = match env_or("STORE_BACKEND", "postgres").to_lowercase().as_str() {
            "postgres" => StoreBackend::Postgres,
            "memory" => StoreBackend::Memory,
            other => {
                return Err(FeederError::config(format!(
                    "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                    other
                )))
            }
        };

        let password = match (env::var("DB_PASSWORD"), store_backend) {
            (Ok(p), _) => p,
            (Err(_), StoreBackend::Memory) => String::new(),
            (Err(_), StoreBackend::Postgres) => {
                return Err(FeederError::config("DB_PASSWORD is required"))
            }
        };

        let defaults = TimeframePlan::default();
        let timeframes = TimeframePlan::new(
            env_parse("BASE_TIMEFRAME", defaults.base)?,
            env_timeframes("DERIVED_TIMEFRAMES", &defaults.derived)?,
            env_timeframes("MEMORY_ONLY_TIMEFRAMES", &BTreeSet::new())?,
            env_timeframes("REST_TIMEFRAMES", &BTreeSet::new())?,
        )?;

        let stream_defaults = StreamConfig::default();
        let page_limit: usize = env_parse("BACKFILL_PAGE_LIMIT", BackfillConfig::default().page_limit)?;

        Ok(Self {
            stream: StreamConfig {
                url: env_or("BINANCE_STREAM_URL", &stream_defaults.url),
                connect_timeout: env_secs("CONNECT_TIMEOUT_SECS", stream_defaults.connect_timeout)?,
                reconnect_delay: env_secs("RECONNECT_DELAY_SECS", stream_defaults.reconnect_delay)?,
                ping_interval: env_secs("PING_INTERVAL_SECS", stream_defaults.ping_interval)?,
                pong_timeout: env_secs("PONG_TIMEOUT_SECS", stream_defaults.pong_timeout)?,
                symbol_refresh_interval: env_secs(
                    "SYMBOL_REFRESH_SECS",
                    stream_defaults.symbol_refresh_interval,
                )?,
            },

            rest: RestConfig {
                base_url: env_or("BINANCE_REST_URL", "https://fapi.binance.com"),
                timeout: env_secs("REST_TIMEOUT_SECS", Duration::from_secs(10))?,
            },

            database: DatabaseConfig {
                host: env_or("DB_HOST", "localhost"),
                port: env_parse("DB_PORT", 5432)?,
                name: env_or("DB_NAME", "candles"),
                user: env_or("DB_USER", "feeder"),
                password,
                pool_max: env_parse("DB_POOL_MAX", 8)?,
            },
            store_backend,

            symbols: SymbolConfig {
                redis_url: env_or("REDIS_URL", "redis://127.0.0.1:6379"),
                key: env_or("SYMBOLS_KEY", "liquid_coins"),
                quote_asset: env_or("SYMBOL_QUOTE", "USDT").to_uppercase(),
                static_symbols: env::var("SYMBOLS").ok().map(|s| split_list(&s)),
            },

            timeframes,

            ingest: IngestConfig {
                queue_capacity: env_parse("INGEST_QUEUE_CAPACITY", IngestConfig::default().queue_capacity)?,
                poll_interval: env_millis("QUEUE_POLL_MS", IngestConfig::default().poll_interval)?,
            },

            backfill: BackfillConfig {
                page_limit: page_limit.clamp(1, MAX_PAGE_LIMIT),
                request_delay: env_millis(
                    "BACKFILL_REQUEST_DELAY_MS",
                    BackfillConfig::default().request_delay,
                )?,
            },

            watchdog: WatchdogConfig {
                interval: env_secs("WATCHDOG_INTERVAL_SECS", WatchdogConfig::default().interval)?,
                grace: env_secs("WATCHDOG_GRACE_SECS", WatchdogConfig::default().grace)?,
            },

            health_check_port: env_parse("HEALTH_CHECK_PORT", 8080)?,

            log_level: env_or("LOG_LEVEL", "info"),

            shutdown_timeout: env_secs("SHUTDOWN_TIMEOUT_SECS", Duration::from_secs(10))?,
        })
    }
}

impl DatabaseConfig {
    /// Create a deadpool configuration.
    pub fn to_pool_config(&self) -> deadpool_postgres::Config {
        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(self.host.clone());
        cfg.port = Some(self.port);
        cfg.dbname = Some(self.name.clone());
        cfg.user = Some(self.user.clone());
        cfg.password = Some(self.password.clone());
        cfg
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| FeederError::config(format!("Invalid {}: '{}'", key, raw))),
        Err(_) => Ok(default),
    }
}

fn env_secs(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_secs()).map(Duration::from_secs)
}

fn env_millis(key: &str, default: Duration) -> Result<Duration> {
    env_parse(key, default.as_millis() as u64).map(Duration::from_millis)
}

fn env_timeframes(key: &str, default: &BTreeSet<Timeframe>) -> Result<BTreeSet<Timeframe>> {
    match env::var(key) {
        Ok(raw) => parse_timeframes(&raw)
            .map_err(|e| FeederError::config(format!("Invalid {}: {}", key, e))),
        Err(_) => Ok(default.clone()),
    }
}

fn parse_timeframes(raw: &str) -> std::result::Result<BTreeSet<Timeframe>, crate::errors::DecodeError> {
    split_list(raw).iter().map(|s| s.parse()).collect()
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
