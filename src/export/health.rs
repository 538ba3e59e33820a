use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "perfshm";

/// Prometheus metrics describing the collector pipeline itself.
///
/// These are the pipeline's own health signals, separate from the user
/// snapshot published to the sink.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Tasks accepted by `put`.
    pub tasks_enqueued: Counter,
    /// Tasks discarded because the collector was not running.
    pub tasks_rejected: Counter,
    /// Tasks drained and accepted by the aggregator.
    pub tasks_collected: Counter,
    /// Tasks drained whose category the aggregator did not handle.
    pub tasks_unhandled: Counter,
    /// Snapshots published.
    pub flushes: Counter,
    /// Failed sink writes.
    pub sink_write_errors: Counter,
    /// Queue depth observed at the start of the last tick.
    pub queue_depth: Gauge,
    /// Integers in the last published snapshot.
    pub snapshot_values: Gauge,
    /// Time spent marshaling and writing one snapshot.
    pub flush_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new instance with all metrics registered.
    ///
    /// `addr` is only used by [`start`](Self::start).
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let tasks_enqueued = Counter::with_opts(
            Opts::new("tasks_enqueued_total", "Tasks accepted by put.").namespace(NAMESPACE),
        )?;
        let tasks_rejected = Counter::with_opts(
            Opts::new(
                "tasks_rejected_total",
                "Tasks discarded because the collector was not running.",
            )
            .namespace(NAMESPACE),
        )?;
        let tasks_collected = Counter::with_opts(
            Opts::new(
                "tasks_collected_total",
                "Tasks drained and folded by the aggregator.",
            )
            .namespace(NAMESPACE),
        )?;
        let tasks_unhandled = Counter::with_opts(
            Opts::new(
                "tasks_unhandled_total",
                "Tasks drained with a category the aggregator does not handle.",
            )
            .namespace(NAMESPACE),
        )?;
        let flushes = Counter::with_opts(
            Opts::new("flushes_total", "Snapshots published to the sink.").namespace(NAMESPACE),
        )?;
        let sink_write_errors = Counter::with_opts(
            Opts::new("sink_write_errors_total", "Failed sink writes.").namespace(NAMESPACE),
        )?;
        let queue_depth = Gauge::with_opts(
            Opts::new("queue_depth", "Queued tasks at the start of the last tick.")
                .namespace(NAMESPACE),
        )?;
        let snapshot_values = Gauge::with_opts(
            Opts::new(
                "snapshot_values",
                "Number of integers in the last published snapshot.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Time spent marshaling and writing one snapshot.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.000_01, 0.000_05, 0.000_1, 0.000_5, 0.001, 0.005, 0.01, 0.05, 0.1,
            ]),
        )?;

        registry.register(Box::new(tasks_enqueued.clone()))?;
        registry.register(Box::new(tasks_rejected.clone()))?;
        registry.register(Box::new(tasks_collected.clone()))?;
        registry.register(Box::new(tasks_unhandled.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(sink_write_errors.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(snapshot_values.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            tasks_enqueued,
            tasks_rejected,
            tasks_collected,
            tasks_unhandled,
            flushes,
            sink_write_errors,
            queue_depth,
            snapshot_values,
            flush_duration,
        })
    }

    /// The registry backing these metrics.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders all metrics in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<SocketAddr> {
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

            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    cancel.cancelled().await;
                })
                .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(local_addr)
    }

    /// Gracefully shuts down the health metrics server.
    pub fn stop(&self) {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
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
