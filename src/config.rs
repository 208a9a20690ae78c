//! Process configuration.
//!
//! Flags are parsed once at startup; the resulting values are immutable
//! and shared read-only with every request handler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use k8s_openapi::api::core::v1::Pod;

/// Default grace period before eviction from a not-ready/unreachable node
pub const DEFAULT_TOLERATION_SECONDS: i64 = 300;
/// Default webhook server port
pub const DEFAULT_WEBHOOK_PORT: u16 = 8443;
/// Default health server port
pub const DEFAULT_HEALTH_PORT: u16 = 8080;
/// Default path to webhook TLS certificate
pub const DEFAULT_CERT_PATH: &str = "/etc/webhook/certs/cert.pem";
/// Default path to webhook TLS private key
pub const DEFAULT_KEY_PATH: &str = "/etc/webhook/certs/key.pem";

#[derive(Parser, Debug, Clone)]
#[command(name = "kube-failover-webhook")]
#[command(about = "Injects not-ready/unreachable tolerations into pods")]
pub struct Args {
    /// Webhook server port
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    pub port: u16,

    /// x509 certificate file for the TLS listener
    #[arg(long, alias = "tlsCertFile", env = "TLS_CERT_FILE", default_value = DEFAULT_CERT_PATH)]
    pub tls_cert_file: PathBuf,

    /// x509 private key file for the TLS listener
    #[arg(long, alias = "tlsKeyFile", env = "TLS_KEY_FILE", default_value = DEFAULT_KEY_PATH)]
    pub tls_key_file: PathBuf,

    /// tolerationSeconds for the injected node.kubernetes.io/not-ready toleration
    #[arg(
        long,
        env = "NOT_READY_TOLERATION_SECONDS",
        default_value_t = DEFAULT_TOLERATION_SECONDS,
        value_parser = clap::value_parser!(i64).range(0..)
    )]
    pub not_ready_toleration_seconds: i64,

    /// tolerationSeconds for the injected node.kubernetes.io/unreachable toleration
    #[arg(
        long,
        env = "UNREACHABLE_TOLERATION_SECONDS",
        default_value_t = DEFAULT_TOLERATION_SECONDS,
        value_parser = clap::value_parser!(i64).range(0..)
    )]
    pub unreachable_toleration_seconds: i64,

    /// Port for /healthz, /readyz and /metrics
    #[arg(long, env = "HEALTH_PORT", default_value_t = DEFAULT_HEALTH_PORT)]
    pub health_port: u16,

    /// Seconds in-flight admissions get to finish after SIGTERM
    #[arg(long, env = "SHUTDOWN_GRACE_PERIOD_SECS", default_value_t = 5)]
    pub shutdown_grace_period_secs: u64,

    /// Only mutate pods carrying this label, e.g. `kubevirt.io=virt-launcher`
    #[arg(long, env = "WORKLOAD_SELECTOR")]
    pub workload_selector: Option<WorkloadSelector>,
}

impl Args {
    /// Grace periods handed to the mutator
    pub fn toleration_config(&self) -> TolerationConfig {
        TolerationConfig {
            not_ready_seconds: self.not_ready_toleration_seconds,
            unreachable_seconds: self.unreachable_toleration_seconds,
        }
    }

    pub fn webhook_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    pub fn health_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.health_port))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

/// Grace periods for the two injected tolerations
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TolerationConfig {
    /// tolerationSeconds of the not-ready toleration
    pub not_ready_seconds: i64,
    /// tolerationSeconds of the unreachable toleration
    pub unreachable_seconds: i64,
}

impl Default for TolerationConfig {
    fn default() -> Self {
        Self {
            not_ready_seconds: DEFAULT_TOLERATION_SECONDS,
            unreachable_seconds: DEFAULT_TOLERATION_SECONDS,
        }
    }
}

/// Label equality selector restricting which pods get mutated
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkloadSelector {
    pub key: String,
    pub value: String,
}

impl WorkloadSelector {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Check whether the pod carries the selected label
    pub fn matches(&self, pod: &Pod) -> bool {
        pod.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.key))
            .is_some_and(|v| *v == self.value)
    }
}

impl FromStr for WorkloadSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                Ok(Self::new(key.trim(), value.trim()))
            }
            _ => Err(format!("expected `key=value`, got {:?}", s)),
        }
    }
}

impl std::fmt::Display for WorkloadSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}
