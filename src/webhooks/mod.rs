//! Mutating admission webhook for pod tolerations.
//!
//! - `review`: AdmissionReview envelope decoding and encoding
//! - `tolerations`: decides whether a pod needs the default tolerations
//!   and builds the JSON patch
//! - `server`: HTTP handler and TLS listener

pub mod review;
mod server;
pub mod tolerations;

pub use review::{Decoded, KubeReviewCodec, Outcome, RequestId, RequestSummary, ReviewCodec};
pub use server::{MUTATE_PATH, WebhookState, admit, create_webhook_router, run_webhook_server};
pub use tolerations::{
    Mutation, NOT_READY_TAINT_KEY, TOLERATIONS_PATH, TolerationMutator, UNREACHABLE_TAINT_KEY,
};

// Re-export kube-rs admission types for contract testing
pub use kube::core::admission::{AdmissionResponse, AdmissionReview};
