//! kube-failover-webhook - injects node failure tolerations into pods.
//!
//! This is the main entry point that:
//! - Parses flags and initializes structured logging
//! - Starts the health server and the TLS webhook server
//! - Drains in-flight admissions on SIGTERM/SIGINT

use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use kube_failover_webhook::{
    Args, HealthState, ServerError, TolerationMutator, WebhookState, run_health_server,
    run_webhook_server,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kube_failover_webhook=info".parse()?),
        )
        .json()
        .init();

    // Another component may already have installed a provider
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        warn!("rustls crypto provider already installed");
    }

    let toleration_config = args.toleration_config();
    info!(
        port = args.port,
        not_ready_toleration_seconds = toleration_config.not_ready_seconds,
        unreachable_toleration_seconds = toleration_config.unreachable_seconds,
        workload_selector = ?args.workload_selector.as_ref().map(ToString::to_string),
        "Starting kube-failover webhook server"
    );

    let health_state = Arc::new(HealthState::new());
    let mutator =
        TolerationMutator::new(toleration_config).with_selector(args.workload_selector.clone());
    let state = Arc::new(WebhookState::new(mutator, health_state.clone()));

    // Health server outlives the webhook so probes keep answering while draining
    let (health_shutdown_tx, mut health_shutdown_rx) = watch::channel(false);
    let mut health_handle = {
        let health_state = health_state.clone();
        let addr = args.health_addr();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = health_shutdown_rx.wait_for(|stop| *stop).await;
            };
            run_health_server(health_state, addr, shutdown).await
        })
    };

    let server_handle = axum_server::Handle::new();

    // Mark ready once the TLS listener is bound
    {
        let server_handle = server_handle.clone();
        let health_state = health_state.clone();
        tokio::spawn(async move {
            if let Some(addr) = server_handle.listening().await {
                info!(%addr, "Webhook server accepting connections");
                health_state.set_ready(true).await;
            }
        });
    }

    let mut webhook_handle = {
        let server_handle = server_handle.clone();
        let addr = args.webhook_addr();
        let cert = args.tls_cert_file.clone();
        let key = args.tls_key_file.clone();
        tokio::spawn(async move { run_webhook_server(state, addr, &cert, &key, server_handle).await })
    };

    let mut exit_error: Option<Box<dyn std::error::Error>> = None;
    let mut webhook_done = false;
    let mut health_done = false;

    tokio::select! {
        result = &mut webhook_handle => {
            webhook_done = true;
            match result {
                Ok(Ok(())) => warn!("Webhook server exited"),
                Ok(Err(e)) => {
                    error!("Webhook server error: {}", e);
                    exit_error = Some(e.into());
                }
                Err(e) => error!("Webhook server task panicked: {}", e),
            }
        }
        result = &mut health_handle => {
            health_done = true;
            match result {
                Ok(Ok(())) => warn!("Health server exited"),
                Ok(Err(e)) => {
                    error!("Health server error: {}", e);
                    exit_error = Some(ServerError::from(e).into());
                }
                Err(e) => error!("Health server task panicked: {}", e),
            }
        }
        // Handle graceful shutdown on SIGTERM or SIGINT
        _ = shutdown_signal() => {
            info!("OS shutdown signal received...");
        }
    }

    // Stop receiving new admissions and let in-flight ones finish
    health_state.set_ready(false).await;
    if !webhook_done {
        let grace = args.shutdown_grace_period();
        info!(
            grace_period_secs = grace.as_secs(),
            "Waiting for in-flight admission requests to complete..."
        );
        server_handle.graceful_shutdown(Some(grace));
        match webhook_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Webhook server error during shutdown: {}", e),
            Err(e) => error!("Webhook server task panicked: {}", e),
        }
    }

    let _ = health_shutdown_tx.send(true);
    if !health_done {
        match health_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!("Health server error: {}", e);
                exit_error.get_or_insert_with(|| ServerError::from(e).into());
            }
            Err(e) => error!("Health server task panicked: {}", e),
        }
    }

    info!("Webhook stopped");
    match exit_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// Note: Signal handler setup failures are fatal - the webhook cannot shut down
/// gracefully without them. Using expect() here is intentional.
#[allow(clippy::expect_used)]
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
