//! Health check HTTP server module.
//!
//! Provides a /health endpoint that returns system status:
//! - Connection states (WebSocket, Database)
//! - Ingestion, aggregation and backfill counters
//! - Error and drop counts

use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Errors above this count mark the service degraded.
const DEGRADED_ERROR_THRESHOLD: u64 = 10;

/// Health check response payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Overall status: healthy, degraded, or unhealthy
    pub status: HealthStatus,
    /// Uptime in seconds
    pub uptime_seconds: u64,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
    /// Open time of the newest closed candle received
    pub last_candle_time: Option<DateTime<Utc>>,
    /// Current timestamp
    pub timestamp: DateTime<Utc>,
}

/// Counters copied from the running components.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Closed candles decoded from the stream
    pub candles_received: u64,
    /// Closed candles accepted by the ingest queue
    pub candles_forwarded: u64,
    /// Closed candles dropped on a full queue
    pub candles_dropped: u64,
    /// Stream candles written to the store
    pub candles_written: u64,
    /// Derived candles written to the store
    pub aggregated_written: u64,
    /// Derived windows skipped for missing base rows
    pub partial_windows: u64,
    /// Candles written by REST backfill
    pub backfilled_candles: u64,
    pub gaps_detected: u64,
    pub decode_errors: u64,
    pub storage_errors: u64,
    pub backfill_stalls: u64,
    pub reconnects: u64,
    pub queue_depth: u64,
    pub subscribed_symbols: usize,
    pub websocket_connected: bool,
    pub database_connected: bool,
    /// Open time (ms) of the newest closed stream candle
    #[serde(skip)]
    pub last_candle_open_time: Option<i64>,
}

impl MetricsSnapshot {
    fn errors(&self) -> u64 {
        self.decode_errors + self.storage_errors + self.backfill_stalls
    }
}

/// Health status enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Shared state for health checks.
#[derive(Clone)]
pub struct HealthState {
    inner: Arc<HealthStateInner>,
}

struct HealthStateInner {
    /// Service start time
    start_time: Instant,
    /// Latest copy of component counters
    metrics: RwLock<MetricsSnapshot>,
}

impl HealthState {
    /// Create a new health state.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HealthStateInner {
                start_time: Instant::now(),
                metrics: RwLock::new(MetricsSnapshot::default()),
            }),
        }
    }

    /// Replace the stored counters.
    pub fn record(&self, snapshot: MetricsSnapshot) {
        *self.inner.metrics.write() = snapshot;
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.read().clone()
    }

    /// Both connections up.
    pub fn is_ready(&self) -> bool {
        let m = self.inner.metrics.read();
        m.websocket_connected && m.database_connected
    }

    /// Build health response.
    pub fn build_response(&self) -> HealthResponse {
        let metrics = self.metrics();
        let last_candle_time = metrics
            .last_candle_open_time
            .and_then(DateTime::from_timestamp_millis);

        HealthResponse {
            status: determine_status(&metrics),
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
            metrics,
            last_candle_time,
            timestamp: Utc::now(),
        }
    }
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

/// Determine overall health status.
fn determine_status(metrics: &MetricsSnapshot) -> HealthStatus {
    if !metrics.database_connected || !metrics.websocket_connected {
        return HealthStatus::Unhealthy;
    }

    if metrics.errors() > DEGRADED_ERROR_THRESHOLD || metrics.candles_dropped > 0 {
        return HealthStatus::Degraded;
    }

    HealthStatus::Healthy
}

/// Health check handler.
async fn health_handler(State(state): State<HealthState>) -> (StatusCode, Json<HealthResponse>) {
    let response = state.build_response();

    let status_code = match response.status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(response))
}

/// Readiness check handler.
async fn ready_handler(State(state): State<HealthState>) -> StatusCode {
    if state.is_ready() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

/// Liveness check handler.
async fn live_handler() -> StatusCode {
    StatusCode::OK
}

/// Create the health check router.
pub fn create_health_router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ready", get(ready_handler))
        .route("/live", get(live_handler))
        .with_state(state)
}

/// Run the health check server until `cancel` fires.
pub async fn run_health_server(
    port: u16,
    state: HealthState,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let app = create_health_router(state);

    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
    info!("Health check server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Health check server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected() -> MetricsSnapshot {
        MetricsSnapshot {
            websocket_connected: true,
            database_connected: true,
            ..MetricsSnapshot::default()
        }
    }

    #[test]
    fn test_health_status_serialization() {
        assert_eq!(
            serde_json::to_string(&HealthStatus::Healthy).unwrap(),
            "\"healthy\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Degraded).unwrap(),
            "\"degraded\""
        );
        assert_eq!(
            serde_json::to_string(&HealthStatus::Unhealthy).unwrap(),
            "\"unhealthy\""
        );
    }

    #[test]
    fn test_health_state() {
        let state = HealthState::new();

        let response = state.build_response();
        assert_eq!(response.metrics.candles_received, 0);
        assert!(response.last_candle_time.is_none());
        assert_eq!(response.status, HealthStatus::Unhealthy);

        state.record(MetricsSnapshot {
            candles_received: 100,
            candles_written: 95,
            subscribed_symbols: 40,
            last_candle_open_time: Some(1_700_000_000_000),
            ..connected()
        });

        let response = state.build_response();
        assert_eq!(response.metrics.candles_received, 100);
        assert_eq!(response.metrics.candles_written, 95);
        assert_eq!(
            response.last_candle_time.map(|t| t.timestamp_millis()),
            Some(1_700_000_000_000)
        );
        assert_eq!(response.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_unhealthy_status() {
        let mut m = connected();
        m.database_connected = false;
        assert_eq!(determine_status(&m), HealthStatus::Unhealthy);

        let mut m = connected();
        m.websocket_connected = false;
        assert_eq!(determine_status(&m), HealthStatus::Unhealthy);
    }

    #[test]
    fn test_degraded_status() {
        let mut m = connected();
        m.decode_errors = 8;
        m.storage_errors = 7;
        assert_eq!(determine_status(&m), HealthStatus::Degraded);

        let mut m = connected();
        m.candles_dropped = 1;
        assert_eq!(determine_status(&m), HealthStatus::Degraded);
    }

    #[test]
    fn test_response_flattens_counters() {
        let state = HealthState::new();
        state.record(MetricsSnapshot {
            gaps_detected: 3,
            ..connected()
        });
        let json = serde_json::to_value(state.build_response()).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["gaps_detected"], 3);
        assert_eq!(json["websocket_connected"], true);
    }

    #[tokio::test]
    async fn test_ready_handler() {
        let state = HealthState::new();
        assert_eq!(
            ready_handler(State(state.clone())).await,
            StatusCode::SERVICE_UNAVAILABLE
        );
        state.record(connected());
        assert_eq!(ready_handler(State(state)).await, StatusCode::OK);
    }
}
