//! Health and metrics HTTP surface (§4.13): `GET /healthz` reports
//! liveness by checking that every assigned partition worker has
//! heartbeated recently, and `GET /metrics` exposes the Prometheus
//! text format for the connector's counters and histograms.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use dashmap::DashMap;
use tracing::info;

use crate::metrics::PrometheusMetrics;

/// How long a partition worker can go without heartbeating before
/// `/healthz` reports it (and therefore the whole process) unhealthy.
const STALE_THRESHOLD: Duration = Duration::from_secs(60);

/// Shared liveness tracker. Partition workers call
/// [`HealthState::heartbeat`] once per poll/commit cycle; the HTTP
/// handler reads it without touching the hot path's locks.
#[derive(Clone, Default)]
pub struct HealthState {
    last_heartbeat_ms: Arc<DashMap<(String, i32), i64>>,
}

impl HealthState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn heartbeat(&self, topic: &str, partition: i32) {
        self.last_heartbeat_ms.insert((topic.to_string(), partition), now_epoch_ms());
    }

    pub fn forget(&self, topic: &str, partition: i32) {
        self.last_heartbeat_ms.remove(&(topic.to_string(), partition));
    }

    fn is_healthy(&self) -> bool {
        let now = now_epoch_ms();
        self.last_heartbeat_ms
            .iter()
            .all(|entry| now - *entry.value() < STALE_THRESHOLD.as_millis() as i64)
    }
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

#[derive(Clone)]
struct AppState {
    health: HealthState,
    metrics: Arc<PrometheusMetrics>,
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    if state.health.is_healthy() {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "stale partition worker")
    }
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (StatusCode::OK, state.metrics.render())
}

/// Binds and serves the health/metrics HTTP surface on `port`, running
/// until the process exits. Intended to be spawned as its own task
/// alongside the consumer loop.
pub async fn serve(port: u16, health: HealthState, metrics: Arc<PrometheusMetrics>) -> std::io::Result<()> {
    let state = AppState { health, metrics };
    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "health/metrics server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_heartbeats_report_healthy() {
        let health = HealthState::new();
        health.heartbeat("orders", 0);
        health.heartbeat("orders", 1);
        assert!(health.is_healthy());
    }

    #[test]
    fn no_tracked_partitions_is_healthy() {
        let health = HealthState::new();
        assert!(health.is_healthy());
    }

    #[test]
    fn forgetting_a_partition_removes_it_from_consideration() {
        let health = HealthState::new();
        health.heartbeat("orders", 0);
        health.forget("orders", 0);
        assert_eq!(health.last_heartbeat_ms.len(), 0);
    }
}
