use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::merge::MergeCounters;

/// Prometheus metrics for node health and observability.
///
/// All metrics use the "trackd" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Frames merged cleanly into the output sequence.
    pub frames_tracked: IntCounter,
    /// Frames fabricated because their producer missed the deadline.
    pub frames_timed_out: IntCounter,
    /// Frames dropped before emission (bad producer, late, stale).
    pub frames_dropped: IntCounter,
    /// Bytes currently used on the experiment filesystem.
    pub disk_used_bytes: IntGauge,
    /// Whether an experiment is running (1=yes, 0=no).
    pub experiment_running: IntGauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let frames_tracked = IntCounter::with_opts(
            Opts::new(
                "frames_tracked_total",
                "Frames merged cleanly into the output sequence.",
            )
            .namespace("trackd"),
        )?;
        let frames_timed_out = IntCounter::with_opts(
            Opts::new(
                "frames_timed_out_total",
                "Frames fabricated because their producer missed the deadline.",
            )
            .namespace("trackd"),
        )?;
        let frames_dropped = IntCounter::with_opts(
            Opts::new("frames_dropped_total", "Frames dropped before emission.")
                .namespace("trackd"),
        )?;
        let disk_used_bytes = IntGauge::with_opts(
            Opts::new(
                "disk_used_bytes",
                "Bytes currently used on the experiment filesystem.",
            )
            .namespace("trackd"),
        )?;
        let experiment_running = IntGauge::with_opts(
            Opts::new(
                "experiment_running",
                "Whether an experiment is running (1=yes, 0=no).",
            )
            .namespace("trackd"),
        )?;

        registry.register(Box::new(frames_tracked.clone()))?;
        registry.register(Box::new(frames_timed_out.clone()))?;
        registry.register(Box::new(frames_dropped.clone()))?;
        registry.register(Box::new(disk_used_bytes.clone()))?;
        registry.register(Box::new(experiment_running.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            frames_tracked,
            frames_timed_out,
            frames_dropped,
            disk_used_bytes,
            experiment_running,
        })
    }

    /// The merger's observable counters.
    pub fn merge_counters(&self) -> MergeCounters {
        MergeCounters {
            frames_tracked: self.frames_tracked.clone(),
            frames_timed_out: self.frames_timed_out.clone(),
            frames_dropped: self.frames_dropped.clone(),
        }
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buf) {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {e}"),
        )
            .into_response();
    }

    (StatusCode::OK, buf).into_response()
}

/// GET /healthz - liveness probe.
async fn healthz_handler() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_once() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.frames_tracked.inc();
        health.frames_dropped.inc_by(3);
        health.experiment_running.set(1);

        let families = health.registry.gather();
        assert_eq!(families.len(), 5);
    }

    #[test]
    fn test_merge_counters_share_backing_values() {
        let health = HealthMetrics::new(":0").expect("metrics");
        let counters = health.merge_counters();
        counters.frames_timed_out.inc();
        assert_eq!(health.frames_timed_out.get(), 1);
    }
}
