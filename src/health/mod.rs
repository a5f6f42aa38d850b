use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::rollup::PassReport;
use crate::scheduler::SchedulerState;

/// Prometheus metrics for rollup health.
///
/// All metrics use the "hourtally" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Rollup passes by outcome (success, failure, cancelled).
    pub passes: CounterVec,
    /// Wall time of each rollup pass (10ms-60s buckets).
    pub pass_duration: Histogram,
    /// Samples read past the watermark.
    pub samples_read: Counter,
    /// Active hours added to totals.
    pub hours_added: Counter,
    /// Entity rows committed.
    pub entities_updated: Counter,
    /// Commits rejected because the watermark would have moved backwards.
    pub watermark_regressions: Counter,
    /// Failed readiness checks (store unreachable or schema error).
    pub readiness_failures: Counter,
    /// Scheduler state code (0=starting, 1=idle, 2=running, 3=retrying, 4=stopped).
    pub scheduler_state: Gauge,
    /// Unix time of the last successful pass.
    pub last_success_timestamp: Gauge,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let passes = CounterVec::new(
            Opts::new("rollup_passes_total", "Total rollup passes by outcome.")
                .namespace("hourtally"),
            &["outcome"],
        )?;
        let pass_duration = Histogram::with_opts(
            HistogramOpts::new(
                "rollup_pass_duration_seconds",
                "Duration of rollup passes in seconds.",
            )
            .namespace("hourtally")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        )?;
        let samples_read = Counter::with_opts(
            Opts::new(
                "rollup_samples_read_total",
                "Total presence samples read past the watermark.",
            )
            .namespace("hourtally"),
        )?;
        let hours_added = Counter::with_opts(
            Opts::new("rollup_hours_added_total", "Total active hours added.")
                .namespace("hourtally"),
        )?;
        let entities_updated = Counter::with_opts(
            Opts::new(
                "rollup_entities_updated_total",
                "Total entity rows committed.",
            )
            .namespace("hourtally"),
        )?;
        let watermark_regressions = Counter::with_opts(
            Opts::new(
                "rollup_watermark_regressions_total",
                "Total commits rejected for moving a watermark backwards.",
            )
            .namespace("hourtally"),
        )?;
        let readiness_failures = Counter::with_opts(
            Opts::new(
                "rollup_readiness_failures_total",
                "Total failed readiness checks.",
            )
            .namespace("hourtally"),
        )?;
        let scheduler_state = Gauge::with_opts(
            Opts::new(
                "rollup_scheduler_state",
                "Scheduler state (0=starting, 1=idle, 2=running, 3=retrying, 4=stopped).",
            )
            .namespace("hourtally"),
        )?;
        let last_success_timestamp = Gauge::with_opts(
            Opts::new(
                "rollup_last_success_timestamp_seconds",
                "Unix time of the last successful rollup pass.",
            )
            .namespace("hourtally"),
        )?;

        registry.register(Box::new(passes.clone()))?;
        registry.register(Box::new(pass_duration.clone()))?;
        registry.register(Box::new(samples_read.clone()))?;
        registry.register(Box::new(hours_added.clone()))?;
        registry.register(Box::new(entities_updated.clone()))?;
        registry.register(Box::new(watermark_regressions.clone()))?;
        registry.register(Box::new(readiness_failures.clone()))?;
        registry.register(Box::new(scheduler_state.clone()))?;
        registry.register(Box::new(last_success_timestamp.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            passes,
            pass_duration,
            samples_read,
            hours_added,
            entities_updated,
            watermark_regressions,
            readiness_failures,
            scheduler_state,
            last_success_timestamp,
        })
    }

    /// Records the counters of a finished pass.
    pub fn record_pass(&self, report: &PassReport) {
        self.samples_read.inc_by(report.samples_read as f64);
        self.hours_added.inc_by(report.hours_added as f64);
        self.entities_updated
            .inc_by(f64::from(report.entities_updated));
        self.watermark_regressions
            .inc_by(f64::from(report.regressions));
    }

    /// Publishes the scheduler's current state.
    pub fn set_scheduler_state(&self, state: SchedulerState) {
        self.scheduler_state.set(f64::from(state.code()));
    }

    /// Renders all registered metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
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

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

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

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_pass_updates_counters() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.record_pass(&PassReport {
            samples_read: 7,
            buckets_considered: 3,
            valid_buckets: 2,
            entities_updated: 2,
            hours_added: 2,
            regressions: 1,
            cancelled: false,
        });

        assert_eq!(health.samples_read.get(), 7.0);
        assert_eq!(health.hours_added.get(), 2.0);
        assert_eq!(health.entities_updated.get(), 2.0);
        assert_eq!(health.watermark_regressions.get(), 1.0);
    }

    #[test]
    fn test_render_contains_namespace() {
        let health = HealthMetrics::new(":0").expect("metrics");
        health.passes.with_label_values(&["success"]).inc();
        health.set_scheduler_state(SchedulerState::Running);

        let text = health.render().expect("render");
        assert!(text.contains("hourtally_rollup_passes_total{outcome=\"success\"} 1"));
        assert!(text.contains("hourtally_rollup_scheduler_state 2"));
    }

    #[tokio::test]
    async fn test_start_and_stop_server() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
        // A second stop is a no-op.
        health.stop().await.expect("stop again");
    }
}
