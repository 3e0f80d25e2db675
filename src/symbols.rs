//! Read-only access to the desired symbol list.
//!
//! The list lives under one Redis key written by the liquidity selector,
//! either as a JSON object keyed by symbol or as a JSON array of symbols.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::OnceCell;
use serde_json::Value;
use tracing::debug;

use crate::config::SymbolConfig;
use crate::errors::SymbolSourceError;

#[async_trait]
pub trait SymbolSource: Send + Sync {
    /// Current target symbols, upper-case, sorted and de-duplicated.
    async fn symbols(&self) -> Result<Vec<String>, SymbolSourceError>;
}

/// Symbol list read from a Redis key over one long-lived, self-reconnecting
/// connection opened on first use.
pub struct RedisSymbolSource {
    client: redis::Client,
    conn: OnceCell<ConnectionManager>,
    key: String,
    quote_asset: String,
}

impl RedisSymbolSource {
    pub fn new(config: &SymbolConfig) -> Result<Self, SymbolSourceError> {
        Ok(Self {
            client: redis::Client::open(config.redis_url.as_str())?,
            conn: OnceCell::new(),
            key: config.key.clone(),
            quote_asset: config.quote_asset.clone(),
        })
    }
}

#[async_trait]
impl SymbolSource for RedisSymbolSource {
    async fn symbols(&self) -> Result<Vec<String>, SymbolSourceError> {
        let mut conn = self
            .conn
            .get_or_try_init(|| ConnectionManager::new(self.client.clone()))
            .await?
            .clone();
        let raw: Option<String> = conn.get(&self.key).await?;

        match raw {
            Some(payload) => {
                let symbols = parse_symbol_payload(&payload, &self.quote_asset)?;
                debug!(key = %self.key, count = symbols.len(), "Loaded symbols");
                Ok(symbols)
            }
            None => {
                debug!(key = %self.key, "Symbol key not set yet");
                Ok(Vec::new())
            }
        }
    }
}

/// A fixed symbol list, from `SYMBOLS` or tests.
pub struct StaticSymbolSource {
    symbols: Vec<String>,
}

impl StaticSymbolSource {
    pub fn new(symbols: impl IntoIterator<Item = String>, quote_asset: &str) -> Self {
        Self {
            symbols: normalize(symbols, quote_asset),
        }
    }
}

#[async_trait]
impl SymbolSource for StaticSymbolSource {
    async fn symbols(&self) -> Result<Vec<String>, SymbolSourceError> {
        Ok(self.symbols.clone())
    }
}

/// Parse `{"BTC": 1.2e9, ...}` or `["BTCUSDT", ...]`.
pub fn parse_symbol_payload(payload: &str, quote_asset: &str) -> Result<Vec<String>, SymbolSourceError> {
    let value: Value = serde_json::from_str(payload)?;
    let names: Vec<String> = match value {
        Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(SymbolSourceError::Shape(format!("non-string entry {}", other))),
            })
            .collect::<Result<_, _>>()?,
        other => {
            return Err(SymbolSourceError::Shape(format!(
                "expected object or array, got {}",
                other
            )))
        }
    };
    Ok(normalize(names, quote_asset))
}

fn normalize(symbols: impl IntoIterator<Item = String>, quote_asset: &str) -> Vec<String> {
    let quote = quote_asset.to_uppercase();
    let mut out: Vec<String> = symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .map(|s| {
            if quote.is_empty() || s.ends_with(&quote) {
                s
            } else {
                format!("{}{}", s, quote)
            }
        })
        .collect();
    out.sort();
    out.dedup();
    out
}
