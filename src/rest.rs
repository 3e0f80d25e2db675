//! Exchange REST client for kline history and server time.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use crate::config::RestConfig;
use crate::decoder::RawKline;
use crate::errors::FetchError;
use crate::timeframe::Timeframe;

const KLINES_PATH: &str = "/fapi/v1/klines";
const TIME_PATH: &str = "/fapi/v1/time";

/// One page request against the kline history endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KlineRequest {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: usize,
}

#[async_trait]
pub trait KlineHistory: Send + Sync {
    /// One page of klines, oldest first.
    async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<RawKline>, FetchError>;

    /// Exchange clock in epoch milliseconds.
    async fn server_time(&self) -> Result<i64, FetchError>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerTime {
    server_time: i64,
}

/// Binance USD-M futures REST client.
pub struct BinanceRestClient {
    http_client: reqwest::Client,
    klines_url: Url,
    time_url: Url,
}

impl BinanceRestClient {
    pub fn new(config: &RestConfig) -> Result<Self, FetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(config.timeout)
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let base = Url::parse(&config.base_url)?;

        Ok(Self {
            http_client,
            klines_url: base.join(KLINES_PATH)?,
            time_url: base.join(TIME_PATH)?,
        })
    }
}

#[async_trait]
impl KlineHistory for BinanceRestClient {
    async fn fetch_klines(&self, request: &KlineRequest) -> Result<Vec<RawKline>, FetchError> {
        let mut query: Vec<(&str, String)> = vec![
            ("symbol", request.symbol.clone()),
            ("interval", request.timeframe.as_str().to_string()),
            ("limit", request.limit.to_string()),
        ];
        if let Some(start) = request.start_time {
            query.push(("startTime", start.to_string()));
        }
        if let Some(end) = request.end_time {
            query.push(("endTime", end.to_string()));
        }

        debug!(
            symbol = %request.symbol,
            timeframe = %request.timeframe,
            start = ?request.start_time,
            end = ?request.end_time,
            "Requesting klines"
        );

        let response = self
            .http_client
            .get(self.klines_url.clone())
            .query(&query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Response(format!("status {}: {}", status, body)));
        }

        let rows: Vec<RawKline> = response.json().await?;
        debug!(symbol = %request.symbol, rows = rows.len(), "Received klines");
        Ok(rows)
    }

    async fn server_time(&self) -> Result<i64, FetchError> {
        let response = self
            .http_client
            .get(self.time_url.clone())
            .send()
            .await?
            .error_for_status()?;
        let body: ServerTime = response.json().await?;
        Ok(body.server_time)
    }
}
