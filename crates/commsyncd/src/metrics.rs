//! Prometheus /metrics + health check HTTP endpoints
//!
//! Endpoints:
//!   GET /metrics  Prometheus text format
//!   GET /healthz  Liveness check (always 200 if process is running)
//!   GET /status   Sync status and online devices as JSON

use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Json, Router};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

use commsync_sync::{SyncContext, SyncEvent, SyncStatus};

type Labels = Vec<(String, String)>;

/// Sync gauges and counters, fed from the context's event stream
#[derive(Clone, Default)]
pub struct SyncMetrics {
    connected_devices: Gauge,
    pending_changes: Gauge,
    unresolved_errors: Gauge,
    paused_kinds: Gauge,
    sync_active: Gauge,
    passes: Counter,
    records_sent: Counter,
    failed_devices: Counter,
    data_changes: Family<Labels, Counter>,
    handoffs: Family<Labels, Counter>,
}

impl SyncMetrics {
    pub fn register(&self, registry: &mut Registry) {
        registry.register(
            "commsync_connected_devices",
            "Online peer devices",
            self.connected_devices.clone(),
        );
        registry.register(
            "commsync_pending_changes",
            "Local changes not yet confirmed by every online peer",
            self.pending_changes.clone(),
        );
        registry.register(
            "commsync_unresolved_errors",
            "Open sync errors",
            self.unresolved_errors.clone(),
        );
        registry.register(
            "commsync_paused_kinds",
            "Data kinds paused on a held conflict",
            self.paused_kinds.clone(),
        );
        registry.register(
            "commsync_sync_active",
            "1 while a sync pass is running",
            self.sync_active.clone(),
        );
        registry.register(
            "commsync_sync_passes",
            "Completed sync passes",
            self.passes.clone(),
        );
        registry.register(
            "commsync_records_sent",
            "Records sent by sync passes",
            self.records_sent.clone(),
        );
        registry.register(
            "commsync_pass_failed_devices",
            "Devices a sync pass could not reach",
            self.failed_devices.clone(),
        );
        registry.register(
            "commsync_data_changes",
            "Records applied from peers, by kind",
            self.data_changes.clone(),
        );
        registry.register(
            "commsync_handoffs",
            "Initiated handoffs, by outcome",
            self.handoffs.clone(),
        );
    }

    pub fn refresh(&self, status: &SyncStatus) {
        self.connected_devices.set(status.connected_devices as i64);
        self.pending_changes.set(status.pending_changes as i64);
        self.unresolved_errors.set(status.unresolved_errors as i64);
        self.paused_kinds.set(status.paused_kinds.len() as i64);
        self.sync_active.set(i64::from(status.active));
    }

    pub fn observe(&self, event: &SyncEvent) {
        match event {
            SyncEvent::PassCompleted(report) if !report.skipped => {
                self.passes.inc();
                self.records_sent.inc_by(report.records_sent as u64);
                self.failed_devices.inc_by(report.failed.len() as u64);
            }
            SyncEvent::DataChanged { kind, .. } => {
                self.data_changes
                    .get_or_create(&vec![("kind".to_string(), kind.to_string())])
                    .inc();
            }
            SyncEvent::Handoff { outcome, .. } => {
                self.handoffs
                    .get_or_create(&vec![("outcome".to_string(), outcome.to_string())])
                    .inc();
            }
            _ => {}
        }
    }
}

/// Shared state for the HTTP handlers
#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<Registry>,
    pub ctx: SyncContext,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(healthz_handler))
        .route("/status", get(status_handler))
        .with_state(state)
}

/// Serve metrics and health endpoints on `addr` (e.g. "127.0.0.1:9464")
pub async fn serve(addr: String, state: HealthState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| anyhow::anyhow!("metrics bind {addr}: {e}"))?;

    tracing::info!(addr = %addr, "metrics: listening on /metrics, /healthz, /status");

    axum::serve(listener, router(state))
        .await
        .map_err(|e| anyhow::anyhow!("metrics server: {e}"))
}

async fn metrics_handler(State(state): State<HealthState>) -> impl IntoResponse {
    let mut body = String::new();
    match encode(&mut body, &state.registry) {
        Ok(()) => (
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

/// Liveness check: returns 200 if the process is running.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn status_handler(State(state): State<HealthState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "device": state.ctx.local_id(),
        "status": state.ctx.get_sync_status(),
        "devices": state.ctx.get_connected_devices(),
    }))
}
