//! HTTP surface of the node.
//!
//! * `GET /status/local`: workloads running on this host.
//! * `GET /status`: workloads of every live peer, fetched concurrently.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use log::{error, info};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::BindError;
use crate::registry::Registry;
use crate::runtime::WorkloadRuntime;

pub mod cluster;
pub mod local;

pub use cluster::PeerClient;

/// Shared by every request.  Holds no request-scoped data.
#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<dyn WorkloadRuntime>,
    pub registry: Arc<dyn Registry>,
    /// Registry prefix peers are listed from.
    pub key_prefix: Arc<str>,
    pub peers: PeerClient,
}

impl AppState {
    pub fn new(
        runtime: Arc<dyn WorkloadRuntime>,
        registry: Arc<dyn Registry>,
        key_prefix: impl Into<Arc<str>>,
        peers: PeerClient,
    ) -> Self {
        Self {
            runtime,
            registry,
            key_prefix: key_prefix.into(),
            peers,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/status", get(cluster::cluster_status))
        .route("/status/local", get(local::local_status))
        .with_state(state)
}

/// A running HTTP listener.  Each connection is served on its own task.
pub struct StatusServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<std::io::Result<()>>,
}

impl StatusServer {
    /// Binds `addr` and starts serving in the background.  Returns once the
    /// listener is bound.
    pub async fn start(addr: SocketAddr, state: AppState) -> Result<Self, BindError> {
        let failed = |source| BindError::Bind { addr, source };
        let listener = TcpListener::bind(addr).await.map_err(failed)?;
        let local_addr = listener.local_addr().map_err(failed)?;

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let app = router(state);
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
        });

        Ok(Self {
            local_addr,
            shutdown,
            handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting connections, lets in-flight requests finish and
    /// releases the listener.
    pub async fn stop(self) {
        self.shutdown.send_replace(true);
        match self.handle.await {
            Ok(Ok(())) => info!("HTTP server on {} stopped", self.local_addr),
            Ok(Err(e)) => error!("HTTP server on {} failed: {}", self.local_addr, e),
            Err(e) => error!("HTTP server task failed: {}", e),
        }
    }
}

/// Leaves the registry first so peers stop being sent here, then closes the
/// listener once in-flight requests are done.
pub async fn shutdown(registry: &dyn Registry, server: StatusServer) {
    registry.stop();
    registry.wait().await;
    server.stop().await;
}
