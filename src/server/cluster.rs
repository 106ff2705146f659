//! Cluster view: fan out to every live peer, fan the answers back in.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::Json;
use futures_util::stream::{self, StreamExt};
use log::{debug, info, warn};

use super::AppState;
use crate::error::{ApiError, PeerQueryError};
use crate::types::{ClusterStatus, HostStatus, PeerRecord};

/// Issues the per-peer requests of the cluster view.
#[derive(Clone)]
pub struct PeerClient {
    http: reqwest::Client,
    timeout: Duration,
    max_concurrency: usize,
}

impl PeerClient {
    /// `timeout` bounds each peer call; `max_concurrency` bounds how many are
    /// in flight at once.
    pub fn new(timeout: Duration, max_concurrency: usize) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            timeout,
            max_concurrency: max_concurrency.max(1),
        })
    }

    /// Queries every peer concurrently and waits for all of them.  A failing
    /// peer only affects its own entry.
    pub async fn query_all(&self, peers: Vec<PeerRecord>) -> BTreeMap<String, HostStatus> {
        stream::iter(peers)
            .map(|peer| async move {
                let status = self.query(&peer).await;
                (peer.address(), status)
            })
            .buffer_unordered(self.max_concurrency)
            .collect()
            .await
    }

    pub async fn query(&self, peer: &PeerRecord) -> HostStatus {
        let url = format!("http://{}/status/local", peer.address());
        let status = match self.fetch(&url).await {
            Ok(status) => status,
            Err(e) => {
                warn!("Peer {} failed: {}", peer.address(), e);
                HostStatus::failed(e.to_string())
            }
        };
        status.for_peer(peer)
    }

    async fn fetch(&self, url: &str) -> Result<HostStatus, PeerQueryError> {
        let resp = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.request_error(e))?;
        let code = resp.status();
        let body = resp.bytes().await.map_err(|e| self.request_error(e))?;

        let mut status: HostStatus = serde_json::from_slice(&body)?;
        debug!("{} answered {}", url, code);
        if status.error.is_none() {
            if !code.is_success() {
                return Err(PeerQueryError::Status(code.as_u16()));
            }
            // A bare `{}` is a peer with nothing running.
            status.containers.get_or_insert_with(Vec::new);
        }
        Ok(status)
    }

    fn request_error(&self, e: reqwest::Error) -> PeerQueryError {
        if e.is_timeout() {
            PeerQueryError::Timeout(self.timeout)
        } else {
            PeerQueryError::Request(e)
        }
    }
}

// GET /status
pub async fn cluster_status(State(ctx): State<AppState>) -> Result<Json<ClusterStatus>, ApiError> {
    let started = Instant::now();
    let peers = match ctx.registry.list_peers(&ctx.key_prefix).await {
        Ok(peers) => peers,
        Err(e) => {
            warn!("GET /status failed to list peers under {:?}: {}", ctx.key_prefix, e);
            return Err(e.into());
        }
    };

    let count = peers.len();
    let hosts = ctx.peers.query_all(peers).await;
    info!("GET /status in {:?} ({} peers)", started.elapsed(), count);
    Ok(Json(ClusterStatus { hosts }))
}
