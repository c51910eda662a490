//! Node-local PVC usage exporter.
//!
//! Periodically measures every volume directory under the provisioner root,
//! joins the sizes with PersistentVolumeClaim metadata from the Kubernetes API
//! and serves `storage_requested_bytes` / `storage_used_bytes` gauges for
//! Prometheus on `/metrics`.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;

use pvc_usage_monitor::claims::KubernetesClaimSource;
use pvc_usage_monitor::config::{Args, Config, LogFormat};
use pvc_usage_monitor::error::StartupError;
use pvc_usage_monitor::inventory::DirectoryInventory;
use pvc_usage_monitor::metrics::MetricsRegistry;
use pvc_usage_monitor::reconciler::Reconciler;
use pvc_usage_monitor::server;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let config = args.into_config().map_err(StartupError::from)?;

    tracing::info!(
        path = %config.root_path.display(),
        delay_seconds = config.interval.as_secs(),
        storage_class = %config.storage_class,
        node = %config.node_name,
        listen_addr = %config.listen_addr,
        "Starting pvc-usage-monitor"
    );

    run(config).await
}

/// Initialize tracing - RUST_LOG takes precedence, fallback to info
fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    // A cluster we cannot reach at startup is a deployment problem, not a tick failure
    let client = kube::Client::try_default()
        .await
        .map_err(StartupError::from)?;
    let version = client
        .apiserver_version()
        .await
        .map_err(StartupError::from)?;
    tracing::info!(
        version = %version.git_version,
        "Connected to Kubernetes API server"
    );

    let registry = Arc::new(MetricsRegistry::new().map_err(StartupError::from)?);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .map_err(|source| StartupError::Bind {
            addr: config.listen_addr,
            source,
        })?;

    let reconciler = Reconciler::new(
        Arc::new(DirectoryInventory::new(&config.root_path)),
        Arc::new(KubernetesClaimSource::new(client, config.list_page_size)),
        Arc::new(registry.pvc_metrics().clone()),
        config.storage_class.clone(),
    )
    .with_source_timeout(config.source_timeout)
    .with_monitor_metrics(registry.monitor_metrics().clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
        }
        let _ = shutdown_tx.send(true);
    });

    let interval = config.interval;
    let loop_shutdown = shutdown_rx.clone();
    let reconcile_loop = tokio::spawn(async move {
        reconciler.run(interval, loop_shutdown).await;
    });

    let mut server_shutdown = shutdown_rx;
    server::run_server(listener, registry, async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .await
    .context("Metrics server failed")?;

    reconcile_loop
        .await
        .context("Reconcile loop panicked")?;

    tracing::info!("Shutdown complete");
    Ok(())
}
