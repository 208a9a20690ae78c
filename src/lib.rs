//! kube-failover-webhook library crate
//!
//! A mutating admission webhook that makes pods tolerate the
//! `node.kubernetes.io/not-ready` and `node.kubernetes.io/unreachable`
//! NoExecute taints for a configurable grace period, so they are not
//! evicted the moment their node stops reporting.

pub mod config;
pub mod error;
pub mod health;
pub mod webhooks;

pub use config::{Args, TolerationConfig, WorkloadSelector};
pub use error::{Error, ServerError};
pub use health::{HealthState, run_health_server};
pub use webhooks::{
    MUTATE_PATH, TolerationMutator, WebhookState, create_webhook_router, run_webhook_server,
};
