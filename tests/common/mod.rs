#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use axum::Router;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use peerstat::error::RegistryError;
use peerstat::registry::Registry;
use peerstat::runtime::WorkloadRuntime;
use peerstat::server::{AppState, PeerClient, StatusServer};
use peerstat::types::{PeerRecord, WorkloadInfo};

pub const PREFIX: &str = "services/peerstat/";

/// Runtime returning a fixed answer.
pub enum FakeRuntime {
    Running(Vec<WorkloadInfo>),
    Broken(String),
}

#[async_trait]
impl WorkloadRuntime for FakeRuntime {
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>> {
        match self {
            FakeRuntime::Running(workloads) => Ok(workloads.clone()),
            FakeRuntime::Broken(msg) => Err(anyhow!("{}", msg)),
        }
    }
}

/// Registry whose peer list is fixed up front.
pub struct StaticRegistry {
    peers: Option<Vec<PeerRecord>>,
    pub list_calls: AtomicUsize,
}

impl StaticRegistry {
    pub fn with_peers(peers: Vec<PeerRecord>) -> Self {
        Self {
            peers: Some(peers),
            list_calls: AtomicUsize::new(0),
        }
    }

    pub fn unavailable() -> Self {
        Self {
            peers: None,
            list_calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl Registry for StaticRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        Ok(())
    }

    fn stop(&self) {}

    async fn wait(&self) {}

    async fn list_peers(&self, prefix: &str) -> Result<Vec<PeerRecord>, RegistryError> {
        assert_eq!(prefix, PREFIX);
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        match &self.peers {
            Some(peers) => Ok(peers.clone()),
            None => Err(RegistryError::Status {
                status: 503,
                body: "etcdserver: no leader".into(),
            }),
        }
    }
}

pub fn workload(id: &str) -> WorkloadInfo {
    serde_json::from_value(json!({
        "Id": id,
        "Names": [format!("/{}", id)],
        "Image": "nginx:1.27",
        "State": "running",
        "Ports": [{"IP": "0.0.0.0", "PrivatePort": 80, "PublicPort": 32768, "Type": "tcp"}],
    }))
    .expect("valid workload")
}

pub fn state(runtime: FakeRuntime, registry: Arc<StaticRegistry>, peer_timeout: Duration) -> AppState {
    let peers = PeerClient::new(peer_timeout, 16).expect("http client");
    AppState::new(Arc::new(runtime), registry, PREFIX, peers)
}

/// A full node listening on loopback.
pub async fn start_node(
    runtime: FakeRuntime,
    registry: Arc<StaticRegistry>,
    peer_timeout: Duration,
) -> StatusServer {
    let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
    StatusServer::start(addr, state(runtime, registry, peer_timeout))
        .await
        .expect("node starts")
}

pub fn peer_at(addr: SocketAddr) -> PeerRecord {
    PeerRecord::new(addr.ip().to_string(), addr.port())
}

/// Serves an arbitrary router on loopback, standing in for a misbehaving peer.
pub async fn spawn_router(app: Router) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, handle)
}

/// An address nothing listens on.
pub async fn closed_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}
