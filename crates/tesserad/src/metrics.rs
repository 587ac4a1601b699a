//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  - Prometheus text format
//!   GET /healthz  - Liveness probe (always 200 if process is running)
//!   GET /readyz   - Readiness probe (200 if the share store is reachable)

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tessera_storage::protocol::NodeStats;
use tessera_storage::SweepReport;

/// Gauges for what the node holds, counters for what the collector took.
#[derive(Clone, Default)]
pub struct NodeMetrics {
    shares: Gauge,
    slots: Gauge,
    bytes: Gauge,
    leases: Gauge,
    sweeps: Counter,
    reclaimed_shares: Counter,
    reclaimed_bytes: Counter,
    reclaim_failures: Counter,
}

impl NodeMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let m = Self::default();
        registry.register("tessera_shares", "Immutable shares held", m.shares.clone());
        registry.register("tessera_slots", "Mutable slots held", m.slots.clone());
        registry.register("tessera_stored_bytes", "Share bytes held", m.bytes.clone());
        registry.register("tessera_leases", "Live leases across all shares", m.leases.clone());
        registry.register("tessera_sweeps", "Collector sweeps run", m.sweeps.clone());
        registry.register(
            "tessera_reclaimed_shares",
            "Shares deleted after their leases lapsed",
            m.reclaimed_shares.clone(),
        );
        registry.register(
            "tessera_reclaimed_bytes",
            "Bytes freed by the collector",
            m.reclaimed_bytes.clone(),
        );
        registry.register(
            "tessera_reclaim_failures",
            "Reclaims whose byte delete failed and will be retried",
            m.reclaim_failures.clone(),
        );
        m
    }

    pub fn observe_stats(&self, stats: &NodeStats) {
        self.shares.set(gauge_value(stats.shares as u64));
        self.slots.set(gauge_value(stats.slots as u64));
        self.bytes.set(gauge_value(stats.bytes));
        self.leases.set(gauge_value(stats.leases as u64));
    }

    pub fn observe_sweep(&self, report: &SweepReport) {
        self.sweeps.inc();
        self.reclaimed_shares.inc_by(report.reclaimed as u64);
        self.reclaimed_bytes.inc_by(report.bytes);
        self.reclaim_failures.inc_by(report.failed as u64);
    }
}

fn gauge_value(v: u64) -> i64 {
    i64::try_from(v).unwrap_or(i64::MAX)
}

/// Shared state behind the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub operator: opendal::Operator,
}

/// Serve Prometheus metrics and health endpoints on `addr` (e.g. "127.0.0.1:9100")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/readyz", get(readyz_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /readyz");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

fn render(registry: &Registry) -> Result<String, std::fmt::Error> {
    let mut body = String::new();
    encode(&mut body, registry)?;
    Ok(body)
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    match render(&state.registry) {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            body,
        ),
        Err(e) => {
            tracing::error!("metrics encode failed: {e}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                e.to_string(),
            )
        }
    }
}

/// Liveness probe: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe: returns 200 if the share store answers, 503 otherwise.
async fn readyz_handler(State(state): State<HealthState>) -> impl IntoResponse {
    if tessera_storage::is_healthy(&state.operator).await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "storage unreachable")
    }
}
