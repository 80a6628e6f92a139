mod config;
mod logging;
mod signaling;

use std::sync::Arc;

use anyhow::Result;
use soupd_sfu::{Orchestrator, ProcessLauncher};
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::signaling::SignalingClient;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let arg = std::env::args().nth(1);
    let config = config::load_config(arg.as_deref())?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    let sfu_config = Arc::new(config.sfu);
    info!(
        shards = sfu_config.shard_count(),
        worker_bin = %sfu_config.worker_bin.display(),
        "soupd starting"
    );

    // 3. Launch the engines
    let shutdown = CancellationToken::new();
    let launcher = Arc::new(ProcessLauncher::new(sfu_config.clone()));
    let (orchestrator, events) = Orchestrator::start(sfu_config, launcher, shutdown.clone())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start media workers: {e}"))?;

    // 4. Connect to the signaling server
    let client = SignalingClient::new(&config.signaling);
    info!(node = %client.node_id(), url = %config.signaling.url, "signaling client starting");
    let signaling = tokio::spawn({
        let orchestrator = orchestrator.clone();
        let shutdown = shutdown.clone();
        async move { client.run(orchestrator, events, shutdown).await }
    });

    // 5. Run until a signal or a server-side disconnect
    tokio::select! {
        () = shutdown_signal() => {}
        () = shutdown.cancelled() => info!("shutting down on signaling disconnect"),
    }
    shutdown.cancel();

    if let Err(e) = signaling.await {
        error!(error = %e, "signaling task failed");
    }
    orchestrator.shutdown();
    info!("soupd stopped");

    Ok(())
}

/// Wait for SIGTERM or SIGINT/Ctrl+C
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
