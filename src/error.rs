//! Error types shared across the daemon.
//!
//! Startup failures (`LookupError`, `BindError`, `ConfigError` and a
//! `RegistryError` from the first publish) abort the process.  Errors that
//! happen while serving a request are turned into an [`ApiError`] and
//! rendered as a JSON body; they never escape the handler.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;

use crate::types::ErrorBody;

/// Address or interface lookup failed.
#[derive(thiserror::Error, Debug)]
pub enum LookupError {
    #[error("no network interface named {0:?}")]
    InterfaceNotFound(String),
    #[error("interface {interface:?} has no {} address", family(.ipv4_only))]
    NoAddress { interface: String, ipv4_only: bool },
    #[error("no interface is up and supports broadcast")]
    NoInterface,
    #[error("invalid target {0:?}")]
    InvalidTarget(String),
    #[error("failed to resolve {host:?}: {reason}")]
    Resolve { host: String, reason: String },
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("failed to enumerate network interfaces: {0}")]
    Enumerate(#[from] nix::Error),
}

fn family(ipv4_only: &bool) -> &'static str {
    if *ipv4_only {
        "IPv4"
    } else {
        "IP"
    }
}

/// Ephemeral port discovery failed.
#[derive(thiserror::Error, Debug)]
pub enum BindError {
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// Publish, refresh or peer listing against the registry failed.
#[derive(thiserror::Error, Debug)]
pub enum RegistryError {
    #[error("registry request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed registry payload: {0}")]
    Decode(String),
    #[error("invalid registry endpoint {0:?}")]
    Endpoint(String),
}

/// One peer's local status could not be fetched.  Only ever rendered into
/// that peer's entry of the cluster view.
#[derive(thiserror::Error, Debug)]
pub enum PeerQueryError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("request failed: {0}")]
    Request(reqwest::Error),
    #[error("peer answered {0} without an error message")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Configuration could not be loaded or failed validation.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("missing required setting `{0}`")]
    Missing(&'static str),
    #[error("invalid setting `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
    #[error("refresh interval ({refresh_secs}s) must be shorter than the registration TTL ({ttl_secs}s)")]
    RefreshInterval { refresh_secs: u64, ttl_secs: u64 },
    #[error("failed to read hostname: {0}")]
    Hostname(nix::Error),
    #[error(transparent)]
    Lookup(#[from] LookupError),
}

/// Request-level failure of one of the HTTP endpoints.
#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0:#}")]
    Workload(anyhow::Error),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status_code = match self {
            ApiError::Workload(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status_code, Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
