use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use osiris::activator::{Activator, ActivatorConfig};
use osiris::k8s::informer::KubePodWatchFactory;
use osiris::k8s::workloads::KubeWorkloadClient;
use osiris::proxy::{Proxy, ProxyConfig};
use osiris::zeroscaler::{Zeroscaler, ZeroscalerConfig};

/// Osiris: scale-to-zero for Kubernetes HTTP workloads
#[derive(Parser)]
#[command(name = "osiris", version, about)]
struct Cli {
    #[command(subcommand)]
    component: Component,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Component {
    /// Run the activator: scale-from-zero and request holding
    Activator,
    /// Run the per-pod sidecar metrics proxy
    Proxy,
    /// Run the zeroscaler: scale idle workloads to zero
    Zeroscaler,
}

/// Grace period between component shutdown and process exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    tracing::info!("Osiris v{}", env!("CARGO_PKG_VERSION"));

    // Canceled on SIGINT or SIGTERM
    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.component {
        Component::Activator => run_activator(cancel).await?,
        Component::Proxy => run_proxy(cancel).await?,
        Component::Zeroscaler => run_zeroscaler(cancel).await?,
    }

    tracing::info!(
        grace_secs = SHUTDOWN_GRACE.as_secs(),
        "allowing graceful shutdown to complete"
    );
    tokio::time::sleep(SHUTDOWN_GRACE).await;
    Ok(())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut terminate =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        tracing::info!("shutdown signal received");
        cancel.cancel();
    });
}

async fn run_activator(cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg = ActivatorConfig::from_env().context("loading activator configuration")?;
    let kube_client = kube::Client::try_default()
        .await
        .context("building Kubernetes client")?;
    let workloads = Arc::new(KubeWorkloadClient::new(kube_client.clone()));
    let pods = Arc::new(KubePodWatchFactory::new(
        kube_client.clone(),
        Duration::from_secs(cfg.informers_resync_interval),
    ));
    let activator = Activator::new(cfg, workloads, pods);
    activator.run(kube_client, cancel).await?;
    Ok(())
}

async fn run_proxy(cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg = ProxyConfig::from_env().context("loading proxy configuration")?;
    Proxy::new(cfg).run(cancel).await?;
    Ok(())
}

async fn run_zeroscaler(cancel: CancellationToken) -> anyhow::Result<()> {
    let cfg = ZeroscalerConfig::from_env().context("loading zeroscaler configuration")?;
    let kube_client = kube::Client::try_default()
        .await
        .context("building Kubernetes client")?;
    let workloads = Arc::new(KubeWorkloadClient::new(kube_client.clone()));
    let pods = Arc::new(KubePodWatchFactory::new(
        kube_client.clone(),
        osiris::k8s::informer::DEFAULT_RESYNC,
    ));
    let zeroscaler = Zeroscaler::new(cfg, workloads, pods);
    zeroscaler.run(kube_client, cancel).await?;
    Ok(())
}
