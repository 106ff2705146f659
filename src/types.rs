//! Data structures exchanged between nodes.
//!
//! These types are serialised using [`serde`](https://serde.rs/) and are
//! either stored in the registry ([`PeerRecord`]) or returned by the HTTP
//! endpoints.  They are built fresh for each request and never cached.

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Name of the workload field holding host port mappings.  It is removed
/// before a workload leaves this node.
pub const EXPOSED_PORTS_FIELD: &str = "Ports";

/// One running workload, relayed as-is from the runtime.
///
/// The content is an opaque JSON object: nodes only forward it, the single
/// exception being [`WorkloadInfo::strip_exposed_ports`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkloadInfo(Map<String, Value>);

impl WorkloadInfo {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn strip_exposed_ports(&mut self) {
        self.0.remove(EXPOSED_PORTS_FIELD);
    }
}

/// A node's registration as stored under its registry key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub host: String,
    pub port: u16,
}

impl PeerRecord {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port`, with IPv6 hosts bracketed so the result can be dialed.
    pub fn address(&self) -> String {
        match self.host.parse::<IpAddr>() {
            Ok(IpAddr::V6(_)) => format!("[{}]:{}", self.host, self.port),
            _ => format!("{}:{}", self.host, self.port),
        }
    }
}

/// Body of `GET /status/local`, and one entry of `GET /status`.
///
/// Exactly one of `error` and `containers` is set.  `host` and `port` are
/// only filled in by the cluster view, so a failed peer can still be
/// identified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containers: Option<Vec<WorkloadInfo>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
}

impl HostStatus {
    pub fn workloads(containers: Vec<WorkloadInfo>) -> Self {
        Self {
            containers: Some(containers),
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Tags the status with the peer it came from.
    pub fn for_peer(mut self, peer: &PeerRecord) -> Self {
        self.host = Some(peer.host.clone());
        self.port = Some(peer.port);
        self
    }
}

/// Body of `GET /status`: one entry per peer, keyed by `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterStatus {
    pub hosts: BTreeMap<String, HostStatus>,
}

/// Body of every failed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
