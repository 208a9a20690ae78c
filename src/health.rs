//! Health server for Kubernetes probes and Prometheus metrics.
//!
//! Provides:
//! - `/healthz` - Liveness probe (always returns 200 if server is running)
//! - `/readyz` - Readiness probe (200 once the webhook listener is up)
//! - `/metrics` - Prometheus metrics endpoint

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::{EncodeLabel, EncodeLabelSet, LabelSetEncoder};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets};
use prometheus_client::registry::Registry;
use tokio::sync::RwLock;
use tracing::info;

/// Labels for admission outcome metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct OutcomeLabels {
    pub outcome: String,
}

impl EncodeLabelSet for OutcomeLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("outcome", self.outcome.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Labels for patch operation metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct PatchLabels {
    pub op: String,
}

impl EncodeLabelSet for PatchLabels {
    fn encode(&self, encoder: &mut LabelSetEncoder<'_>) -> Result<(), std::fmt::Error> {
        ("op", self.op.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

/// Shared metrics for the webhook
pub struct Metrics {
    /// Admission requests by outcome
    pub admission_requests_total: Family<OutcomeLabels, Counter>,
    /// Emitted patches by operation
    pub patches_total: Family<PatchLabels, Counter>,
    /// Time spent handling one admission request
    pub admission_duration_seconds: Histogram,
    /// Prometheus registry
    registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    /// Create a new metrics instance with registered metrics
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let admission_requests_total = Family::<OutcomeLabels, Counter>::default();
        registry.register(
            "failover_webhook_admission_requests",
            "Total number of admission requests by outcome",
            admission_requests_total.clone(),
        );

        let patches_total = Family::<PatchLabels, Counter>::default();
        registry.register(
            "failover_webhook_patches",
            "Total number of toleration patches by operation",
            patches_total.clone(),
        );

        let admission_duration_seconds = Histogram::new(exponential_buckets(0.0001, 2.0, 14));
        registry.register(
            "failover_webhook_admission_duration_seconds",
            "Duration of admission request handling in seconds",
            admission_duration_seconds.clone(),
        );

        Self {
            admission_requests_total,
            patches_total,
            admission_duration_seconds,
            registry,
        }
    }

    /// Count an admission request (`patched`, `unchanged`, `skipped`, `rejected`, `error`)
    pub fn record_admission(&self, outcome: &str) {
        let labels = OutcomeLabels {
            outcome: outcome.to_string(),
        };
        self.admission_requests_total.get_or_create(&labels).inc();
    }

    /// Count an emitted patch (`add` or `replace`)
    pub fn record_patch(&self, op: &str) {
        let labels = PatchLabels { op: op.to_string() };
        self.patches_total.get_or_create(&labels).inc();
    }

    pub fn observe_admission_duration(&self, duration_secs: f64) {
        self.admission_duration_seconds.observe(duration_secs);
    }

    /// Encode metrics to Prometheus text format
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        if encode(&mut buffer, &self.registry).is_err() {
            tracing::error!("Failed to encode metrics");
            return "# Error encoding metrics".to_string();
        }
        buffer
    }
}

/// Shared state for the health server
pub struct HealthState {
    /// Whether the webhook listener is serving
    ready: RwLock<bool>,
    /// Metrics registry
    pub metrics: Metrics,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Create a new health state (starts as not ready)
    pub fn new() -> Self {
        Self {
            ready: RwLock::new(false),
            metrics: Metrics::new(),
        }
    }

    /// Mark the webhook as ready or not ready
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// Check if the webhook is ready
    pub async fn is_ready(&self) -> bool {
        *self.ready.read().await
    }
}

/// Liveness probe handler
///
/// Returns 200 OK if the process is alive.
async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness probe handler
///
/// Returns 503 Service Unavailable before the TLS listener is bound and
/// after a shutdown signal.
async fn readyz(State(state): State<Arc<HealthState>>) -> Response {
    if state.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready").into_response()
    }
}

/// Metrics handler
async fn metrics_handler(State(state): State<Arc<HealthState>>) -> impl IntoResponse {
    let body = state.metrics.encode();
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

/// Create the health server router
pub fn create_router(state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Run the health server until `shutdown` resolves
pub async fn run_health_server(
    state: Arc<HealthState>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let app = create_router(state);

    info!(%addr, "Starting health server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}
