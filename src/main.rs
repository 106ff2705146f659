//! peerstat daemon entry point.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use log::{error, info};
use tokio::signal;

use peerstat::config::{Cli, Config};
use peerstat::lookup::{find_open_port, Protocol};
use peerstat::registry::{EtcdRegistry, Registry};
use peerstat::runtime::{DockerRuntime, WorkloadRuntime};
use peerstat::server::{shutdown, AppState, PeerClient, StatusServer};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    env_logger::init();

    // Load configuration
    let cli = Cli::parse();
    let cfg = Config::load(&cli)?;

    // Listen port: explicit, or a free one on the chosen interface
    let port = match cfg.port {
        0 => find_open_port(cfg.interface.as_deref(), cfg.ipv4_only, Protocol::Tcp)
            .await
            .context("failed to find an open port")?,
        port => port,
    };
    let node = cfg.populate(port).await?;
    info!("Starting peerstat with config: {:?}", node);

    // Container Runtime (Docker)
    let runtime: Arc<dyn WorkloadRuntime> = Arc::new(
        DockerRuntime::connect(node.show_size).context("failed to connect to Docker")?,
    );

    // Registry
    let registry: Arc<dyn Registry> =
        Arc::new(EtcdRegistry::new(&node.registry_url, node.registration())?);
    registry
        .start()
        .await
        .with_context(|| format!("failed to register with {}", node.registry_url))?;

    // HTTP Server
    let peers = PeerClient::new(node.peer_timeout, node.max_concurrent_peers)?;
    let state = AppState::new(runtime, Arc::clone(&registry), node.key_prefix.as_str(), peers);
    let server = match StatusServer::start(node.listen, state).await {
        Ok(server) => server,
        Err(e) => {
            registry.stop();
            registry.wait().await;
            return Err(e.into());
        }
    };
    info!("Listening on: {}", server.local_addr());

    // Graceful Shutdown
    shutdown_signal().await;

    shutdown(registry.as_ref(), server).await;

    info!("Shutdown complete.");
    Ok(())
}

/// Resolves on SIGINT, SIGTERM or SIGQUIT.  SIGKILL cannot be caught.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match (signal(SignalKind::terminate()), signal(SignalKind::quit())) {
            (Ok(mut term), Ok(mut quit)) => {
                tokio::select! {
                    _ = term.recv() => info!("Received SIGTERM, shutting down..."),
                    _ = quit.recv() => info!("Received SIGQUIT, shutting down..."),
                }
            }
            (Err(err), _) | (_, Err(err)) => {
                error!("Unable to listen for shutdown signals: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        _ = terminate => {}
    }
}
