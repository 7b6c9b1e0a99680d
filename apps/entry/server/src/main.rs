use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use entry_server::{
    auth::Authorizer,
    config::{Cli, ServerConfig},
    registry::SessionRegistry,
    router,
    runtime::DockerRuntime,
    telemetry::{Telemetry, TelemetryOptions},
    AppState,
};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::signal;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init(&TelemetryOptions::from_env())?;

    let cli = Cli::parse();
    let config = ServerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        docker_endpoint = ?config.docker_endpoint,
        tls = config.docker_cert_path.is_some(),
        "starting entry server"
    );

    run(config, telemetry.metrics_handle()).await
}

async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let runtime = DockerRuntime::connect_with_retry(
        &config.docker_endpoint,
        config.docker_cert_path.as_ref(),
        config.docker_retry,
    )
    .await;
    let authorizer = Authorizer::new(config.console_auth_url.clone())
        .context("failed to build console auth client")?;

    let registry = SessionRegistry::new();
    let state = Arc::new(AppState {
        runtime: Arc::new(runtime),
        authorizer,
        handshake_timeout: config.handshake_timeout,
        bridge: config.bridge.clone(),
        registry: registry.clone(),
        metrics: Some(metrics),
    });

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!("entry listening on {}", config.listen_addr);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        active_sessions = registry.len(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
