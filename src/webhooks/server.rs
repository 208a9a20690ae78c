//! Admission webhook server.
//!
//! Serves `POST /mutate` over TLS. The API server sends Pod CREATE/UPDATE
//! reviews here (see the MutatingWebhookConfiguration) and gets back the
//! same review with the toleration patch attached.
//!
//! The certificate and key are mounted from a secret, by default under
//! /etc/webhook/certs/.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
    routing::post,
};
use axum_server::Handle;
use axum_server::tls_rustls::RustlsConfig;
use tracing::{debug, error, info, warn};

use crate::error::{Error, ServerError};
use crate::health::HealthState;
use crate::webhooks::review::{Decoded, KubeReviewCodec, Outcome, ReviewCodec};
use crate::webhooks::tolerations::{Mutation, TolerationMutator, patch_op};

/// Path the MutatingWebhookConfiguration points at
pub const MUTATE_PATH: &str = "/mutate";

const APPLICATION_JSON: &str = "application/json";

/// Shared state for webhook handlers
pub struct WebhookState {
    pub mutator: TolerationMutator,
    pub codec: Box<dyn ReviewCodec>,
    pub health: Arc<HealthState>,
}

impl WebhookState {
    pub fn new(mutator: TolerationMutator, health: Arc<HealthState>) -> Self {
        Self {
            mutator,
            codec: Box::new(KubeReviewCodec),
            health,
        }
    }

    /// Swap the review wire format
    #[must_use]
    pub fn with_codec(mut self, codec: Box<dyn ReviewCodec>) -> Self {
        self.codec = codec;
        self
    }
}

/// Create the webhook router
pub fn create_webhook_router(state: Arc<WebhookState>) -> Router {
    Router::new()
        .route(MUTATE_PATH, post(mutate_pod))
        .with_state(state)
}

async fn mutate_pod(
    State(state): State<Arc<WebhookState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let content_type = headers.get(CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let response = admit(&state, content_type, &body);
    state
        .health
        .metrics
        .observe_admission_duration(started.elapsed().as_secs_f64());
    response
}

/// Handle one admission request body.
///
/// Content errors short-circuit with a plain-text status; everything
/// past a successful content check is answered with an AdmissionReview.
pub fn admit(state: &WebhookState, content_type: Option<&str>, body: &[u8]) -> Response {
    let metrics = &state.health.metrics;

    if body.is_empty() {
        let err = Error::EmptyBody;
        error!(error = %err, "Rejecting admission request");
        metrics.record_admission("error");
        return (err.status_code(), err.to_string()).into_response();
    }

    if !is_json(content_type) {
        let err = Error::UnsupportedMediaType(content_type.unwrap_or_default().to_string());
        error!(error = %err, "Rejecting admission request");
        metrics.record_admission("error");
        return (err.status_code(), err.to_string()).into_response();
    }

    let (status, outcome, decoded) = match state.codec.decode(body) {
        Ok(decoded) => {
            let outcome = evaluate(state, &decoded);
            (StatusCode::OK, outcome, Some(decoded))
        }
        Err(err) => {
            error!(error = %err, kind = err.kind(), "Can't decode body");
            metrics.record_admission("error");
            (err.status_code(), Outcome::Rejected(err.to_string()), None)
        }
    };

    let id = decoded.as_ref().map(|d| &d.id);
    match state.codec.encode(outcome, id) {
        Ok(bytes) => (status, [(CONTENT_TYPE, APPLICATION_JSON)], bytes).into_response(),
        Err(err) => {
            error!(uid = ?id.map(|id| &id.uid), error = %err, "Couldn't write response");
            metrics.record_admission("error");
            (err.status_code(), err.to_string()).into_response()
        }
    }
}

/// Run the mutator on a decoded request and choose the answer
fn evaluate(state: &WebhookState, decoded: &Decoded) -> Outcome {
    let metrics = &state.health.metrics;
    let uid = &decoded.id.uid;
    let summary = &decoded.summary;

    let pod = match &decoded.pod {
        Ok(pod) => pod,
        Err(err) => {
            warn!(
                uid = %uid,
                operation = %summary.operation,
                namespace = ?summary.namespace,
                name = %summary.name,
                error = %err,
                "Could not read pod from admission request"
            );
            metrics.record_admission("rejected");
            return Outcome::Rejected(err.to_string());
        }
    };

    match state.mutator.mutate(pod) {
        Ok(Mutation::Unchanged) => {
            debug!(uid = %uid, name = %summary.name, "Pod already tolerates node failure taints");
            metrics.record_admission("unchanged");
            Outcome::Allowed
        }
        Ok(Mutation::Skipped) => {
            debug!(uid = %uid, name = %summary.name, "Pod outside workload selector");
            metrics.record_admission("skipped");
            Outcome::Allowed
        }
        Ok(Mutation::Patch(patch)) => {
            let op = patch_op(&patch);
            info!(
                uid = %uid,
                operation = %summary.operation,
                namespace = ?summary.namespace,
                name = %summary.name,
                op = op,
                patch = %serde_json::to_string(&patch).unwrap_or_default(),
                "Patching pod tolerations"
            );
            metrics.record_admission("patched");
            metrics.record_patch(op);
            Outcome::Patched(patch)
        }
        Err(err @ Error::InvalidPodPayload(_)) => {
            warn!(uid = %uid, name = %summary.name, error = %err, "Pod cannot be patched");
            metrics.record_admission("rejected");
            Outcome::Rejected(err.to_string())
        }
        Err(err) => {
            error!(uid = %uid, error = %err, "Could not make patch data");
            metrics.record_admission("error");
            Outcome::Rejected(err.to_string())
        }
    }
}

/// Compare the media type essence, ignoring parameters like charset
fn is_json(content_type: Option<&str>) -> bool {
    content_type
        .and_then(|ct| ct.split(';').next())
        .is_some_and(|essence| essence.trim().eq_ignore_ascii_case(APPLICATION_JSON))
}

/// Run the webhook server with TLS until the handle shuts it down.
///
/// # Arguments
/// * `state` - Shared handler state
/// * `addr` - Address to bind
/// * `cert_path` - Path to TLS certificate file (PEM format)
/// * `key_path` - Path to TLS private key file (PEM format)
/// * `handle` - Used by the caller for graceful shutdown
pub async fn run_webhook_server(
    state: Arc<WebhookState>,
    addr: SocketAddr,
    cert_path: &Path,
    key_path: &Path,
    handle: Handle,
) -> Result<(), ServerError> {
    let app = create_webhook_router(state);

    let config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(ServerError::TlsConfig)?;

    info!(%addr, path = MUTATE_PATH, "Webhook server listening with TLS");

    axum_server::bind_rustls(addr, config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Webhook server stopped");
    Ok(())
}
