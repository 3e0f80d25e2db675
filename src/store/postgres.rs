//! Postgres candle store.
//!
//! Handles:
//! - Connection pooling through deadpool
//! - Per-timeframe tables with a `(symbol, open_time)` primary key
//! - Native `ON CONFLICT` upserts, batched in one transaction

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod, Runtime};
use rust_decimal::Decimal;
use tokio_postgres::{types::ToSql, NoTls, Row};
use tracing::{debug, info};

use super::CandleStore;
use crate::candle::Candle;
use crate::config::DatabaseConfig;
use crate::errors::{FeederError, Result, StorageError};
use crate::timeframe::Timeframe;

const COLUMNS: &str = "symbol, open_time, close_time, event_time, first_trade_id, last_trade_id, \
     open_price, high_price, low_price, close_price, \
     base_volume, quote_volume, taker_buy_base_volume, taker_buy_quote_volume, \
     trade_count, is_closed, open_interest, funding_rate";

/// Postgres-backed candle store.
pub struct PostgresCandleStore {
    /// Connection pool
    pool: Pool,
    /// Upsert statement text per timeframe
    upserts: HashMap<Timeframe, String>,
}

impl PostgresCandleStore {
    /// Create the pool and verify connectivity.
    pub async fn connect(config: &DatabaseConfig, timeframes: &[Timeframe]) -> Result<Self> {
        let pg_config = config.to_pool_config();

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = Manager::from_config(
            pg_config
                .get_pg_config()
                .map_err(|e| FeederError::config(format!("Invalid PG config: {}", e)))?,
            NoTls,
            mgr_config,
        );

        let pool = Pool::builder(mgr)
            .max_size(config.pool_max)
            .wait_timeout(Some(Duration::from_secs(10)))
            .create_timeout(Some(Duration::from_secs(10)))
            .recycle_timeout(Some(Duration::from_secs(10)))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| FeederError::config(format!("Failed to create pool: {}", e)))?;

        // Test connection
        let client = pool.get().await.map_err(StorageError::from)?;
        client
            .simple_query("SELECT 1")
            .await
            .map_err(StorageError::from)?;
        info!("Database connection pool established");

        let upserts = timeframes
            .iter()
            .map(|tf| (*tf, upsert_sql(tf.table())))
            .collect();

        Ok(Self { pool, upserts })
    }

    /// Create missing candle tables.
    pub async fn ensure_schema(&self) -> std::result::Result<(), StorageError> {
        let client = self.pool.get().await?;
        let mut tables: Vec<Timeframe> = self.upserts.keys().copied().collect();
        tables.sort();

        for tf in tables {
            client.batch_execute(&create_table_sql(tf.table())).await?;
            debug!(table = tf.table(), "Ensured candle table");
        }
        Ok(())
    }

    fn statement(&self, timeframe: Timeframe) -> std::result::Result<&str, StorageError> {
        self.upserts
            .get(&timeframe)
            .map(String::as_str)
            .ok_or(StorageError::UnknownTimeframe(timeframe))
    }
}

#[async_trait]
impl CandleStore for PostgresCandleStore {
    async fn upsert(&self, timeframe: Timeframe, candle: &Candle) -> std::result::Result<(), StorageError> {
        let sql = self.statement(timeframe)?;
        let client = self.pool.get().await?;
        let statement = client.prepare_cached(sql).await?;
        client.execute(&statement, &candle_params(candle)).await?;
        Ok(())
    }

    async fn upsert_batch(
        &self,
        timeframe: Timeframe,
        candles: &[Candle],
    ) -> std::result::Result<(), StorageError> {
        if candles.is_empty() {
            return Ok(());
        }
        let sql = self.statement(timeframe)?;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let statement = tx.prepare_cached(sql).await?;

        for candle in candles {
            tx.execute(&statement, &candle_params(candle)).await?;
        }
        tx.commit().await?;

        debug!(timeframe = %timeframe, rows = candles.len(), "Upserted candle batch");
        Ok(())
    }

    async fn latest_open_time(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> std::result::Result<Option<i64>, StorageError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                &format!("SELECT MAX(open_time) FROM {} WHERE symbol = $1", timeframe.table()),
                &[&symbol],
            )
            .await?;
        Ok(row.get(0))
    }

    async fn distinct_symbols(
        &self,
        timeframe: Timeframe,
    ) -> std::result::Result<BTreeSet<String>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(&format!("SELECT DISTINCT symbol FROM {}", timeframe.table()), &[])
            .await?;
        Ok(rows.iter().map(|r| r.get(0)).collect())
    }

    async fn range_query(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: i64,
        end: i64,
    ) -> std::result::Result<Vec<Candle>, StorageError> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                &format!(
                    "SELECT {} FROM {} WHERE symbol = $1 AND open_time BETWEEN $2 AND $3 ORDER BY open_time ASC",
                    COLUMNS,
                    timeframe.table()
                ),
                &[&symbol, &start, &end],
            )
            .await?;
        Ok(rows.iter().map(|r| candle_from_row(r, timeframe)).collect())
    }

    async fn ping(&self) -> bool {
        match self.pool.get().await {
            Ok(client) => client.simple_query("SELECT 1").await.is_ok(),
            Err(_) => false,
        }
    }
}

fn create_table_sql(table: &str) -> String {
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            symbol TEXT NOT NULL,
            open_time BIGINT NOT NULL,
            close_time BIGINT NOT NULL,
            event_time BIGINT,
            first_trade_id BIGINT,
            last_trade_id BIGINT,
            open_price NUMERIC NOT NULL,
            high_price NUMERIC NOT NULL,
            low_price NUMERIC NOT NULL,
            close_price NUMERIC NOT NULL,
            base_volume NUMERIC NOT NULL,
            quote_volume NUMERIC NOT NULL,
            taker_buy_base_volume NUMERIC NOT NULL,
            taker_buy_quote_volume NUMERIC NOT NULL,
            trade_count BIGINT NOT NULL,
            is_closed BOOLEAN NOT NULL,
            open_interest NUMERIC,
            funding_rate NUMERIC,
            PRIMARY KEY (symbol, open_time)
        )
        "#
    )
}

/// Upsert keyed on `(symbol, open_time)`. Enrichment columns keep their
/// stored value when the incoming row has none.
fn upsert_sql(table: &str) -> String {
    format!(
        r#"
        INSERT INTO {table} ({COLUMNS})
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
        ON CONFLICT (symbol, open_time) DO UPDATE SET
            close_time = EXCLUDED.close_time,
            event_time = EXCLUDED.event_time,
            first_trade_id = EXCLUDED.first_trade_id,
            last_trade_id = EXCLUDED.last_trade_id,
            open_price = EXCLUDED.open_price,
            high_price = EXCLUDED.high_price,
            low_price = EXCLUDED.low_price,
            close_price = EXCLUDED.close_price,
            base_volume = EXCLUDED.base_volume,
            quote_volume = EXCLUDED.quote_volume,
            taker_buy_base_volume = EXCLUDED.taker_buy_base_volume,
            taker_buy_quote_volume = EXCLUDED.taker_buy_quote_volume,
            trade_count = EXCLUDED.trade_count,
            is_closed = EXCLUDED.is_closed,
            open_interest = COALESCE(EXCLUDED.open_interest, {table}.open_interest),
            funding_rate = COALESCE(EXCLUDED.funding_rate, {table}.funding_rate)
        "#
    )
}

fn candle_params(c: &Candle) -> [&(dyn ToSql + Sync); 18] {
    [
        &c.symbol,
        &c.open_time,
        &c.close_time,
        &c.event_time,
        &c.first_trade_id,
        &c.last_trade_id,
        &c.open,
        &c.high,
        &c.low,
        &c.close,
        &c.base_volume,
        &c.quote_volume,
        &c.taker_buy_base_volume,
        &c.taker_buy_quote_volume,
        &c.trade_count,
        &c.is_closed,
        &c.open_interest,
        &c.funding_rate,
    ]
}

fn candle_from_row(row: &Row, timeframe: Timeframe) -> Candle {
    Candle {
        symbol: row.get("symbol"),
        timeframe,
        open_time: row.get("open_time"),
        close_time: row.get("close_time"),
        open: row.get::<_, Decimal>("open_price"),
        high: row.get("high_price"),
        low: row.get("low_price"),
        close: row.get("close_price"),
        base_volume: row.get("base_volume"),
        quote_volume: row.get("quote_volume"),
        taker_buy_base_volume: row.get("taker_buy_base_volume"),
        taker_buy_quote_volume: row.get("taker_buy_quote_volume"),
        trade_count: row.get("trade_count"),
        is_closed: row.get("is_closed"),
        event_time: row.get("event_time"),
        first_trade_id: row.get("first_trade_id"),
        last_trade_id: row.get("last_trade_id"),
        open_interest: row.get("open_interest"),
        funding_rate: row.get("funding_rate"),
    }
}
