mod utils {
    pub mod errors;
    pub mod logger;
    pub mod psutils;
}

mod config;
mod exporter;
mod publisher;
mod resolvers;
mod sampler;
mod server;
mod sources;
mod supervisor;

use clap::Parser;
use config::{Cli, ExporterConfig};
use exporter::GpuMemoryExporter;
use log::{error, info, warn};
use prometheus::Registry;
use publisher::{GpuMemoryGauge, Publisher};
use resolvers::{ContainerResolver, DockerCli, IdentityResolver, NoContainers};
use sampler::Sampler;
use server::MetricsServer;
use sources::NvmlSource;
use std::process::ExitCode;
use supervisor::Supervisor;
use tokio_util::sync::CancellationToken;
use utils::errors::ExporterError;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    utils::logger::setup_logger();
    info!("Application started");

    match run(cli).await {
        Ok(()) => {
            info!("Exporter stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<(), ExporterError> {
    let config = cli.into_config()?;

    if !NvmlSource::is_available() {
        warn!("NVML is not available on this host, sampling passes will fail until it is");
    }

    let registry = Registry::new();
    let gauge = GpuMemoryGauge::register(&registry)?;

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown_signal(cancel.clone()));

    let server = MetricsServer::start(registry, config.listen_addr, cancel.clone()).await?;
    info!("Serving metrics on http://{}/metrics", server.local_addr());

    let result = match &config.containers {
        Some(containers) => {
            info!(
                "Resolving container names from {} with {}",
                containers.proc_root.display(),
                containers.docker_bin.display()
            );
            let docker = DockerCli::new(&containers.docker_bin, containers.docker_timeout);
            let resolver = ContainerResolver::new(&containers.proc_root, docker);
            supervise(&config, gauge, resolver, &cancel).await
        }
        None => {
            info!("Container lookup disabled, reporting OS users only");
            supervise(&config, gauge, NoContainers, &cancel).await
        }
    };

    // stop serving stale values once the loop is gone
    cancel.cancel();
    server.stopped().await;
    result
}

async fn supervise<R: IdentityResolver>(
    config: &ExporterConfig,
    gauge: GpuMemoryGauge,
    resolver: R,
    cancel: &CancellationToken,
) -> Result<(), ExporterError> {
    let exporter = GpuMemoryExporter::new(
        Sampler::new(NvmlSource::new(), resolver),
        Publisher::new(gauge),
    );
    Supervisor::new(exporter, config.interval, config.retry)
        .run(cancel)
        .await
}

async fn cancel_on_shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutting down monitoring...");
    cancel.cancel();
}
