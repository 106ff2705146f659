//! [`Registry`] backed by etcd, spoken to through its v3 JSON gateway.
//!
//! The registration lives under a lease: it disappears on its own once the
//! lease TTL elapses without a keepalive, so a crashed node drops out of the
//! peer list without anyone cleaning up after it.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error, info, warn};
use serde::de::{self, DeserializeOwned};
use serde::{Deserialize, Deserializer};
use serde_json::{json, Value};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};

use super::Registry;
use crate::error::RegistryError;
use crate::types::PeerRecord;

/// Upper bound for a single call to etcd.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Upper bound for the lease revoke on shutdown.
const REVOKE_TIMEOUT: Duration = Duration::from_secs(2);

/// What this node publishes and how it keeps it alive.
#[derive(Debug, Clone)]
pub struct Registration {
    pub key: String,
    pub record: PeerRecord,
    pub ttl: Duration,
    pub refresh_interval: Duration,
}

pub struct EtcdRegistry {
    client: EtcdClient,
    registration: Registration,
    shutdown: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl EtcdRegistry {
    pub fn new(endpoint: &str, registration: Registration) -> Result<Self, RegistryError> {
        let client = EtcdClient::new(endpoint)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            registration,
            shutdown,
            worker: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn start(&self) -> Result<(), RegistryError> {
        let lease = self.client.publish(&self.registration).await?;
        info!(
            "Registered {} at {} (lease {:x}, ttl {:?})",
            self.registration.record.address(),
            self.registration.key,
            lease,
            self.registration.ttl
        );

        let shutdown = self.shutdown.subscribe();
        let handle = tokio::spawn(refresh_loop(
            self.client.clone(),
            self.registration.clone(),
            lease,
            shutdown,
        ));
        if let Some(previous) = self.worker.lock().await.replace(handle) {
            warn!("Registry started twice, dropping the previous refresh loop");
            previous.abort();
        }
        Ok(())
    }

    fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn wait(&self) {
        let handle = self.worker.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Registry refresh loop failed: {}", e);
            }
        }
    }

    async fn list_peers(&self, prefix: &str) -> Result<Vec<PeerRecord>, RegistryError> {
        let entries = self.client.range_prefix(prefix).await?;
        let mut peers = Vec::with_capacity(entries.len());
        for (key, value) in entries {
            match serde_json::from_slice::<PeerRecord>(&value) {
                Ok(peer) => peers.push(peer),
                Err(e) => warn!("Skipping registry entry {}: {}", key, e),
            }
        }
        Ok(peers)
    }
}

/// Keeps the lease alive until shutdown, then revokes it.  Refreshes run one
/// after another on this single task; a slow refresh delays the next tick
/// rather than overlapping with it.  Shutdown abandons a refresh in flight.
async fn refresh_loop(
    client: EtcdClient,
    registration: Registration,
    mut lease: i64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = interval(registration.refresh_interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; the key was just published.
    tick.tick().await;

    while !*shutdown.borrow() {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            _ = tick.tick() => {}
        }

        let refreshed = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            refreshed = client.refresh(&registration, lease) => refreshed,
        };
        match refreshed {
            Ok(current) if current != lease => {
                info!(
                    "Registration {} moved to lease {:x}",
                    registration.key, current
                );
                lease = current;
            }
            Ok(_) => debug!("Refreshed registration {}", registration.key),
            Err(e) => warn!(
                "Failed to refresh registration {}: {}. Retrying in {:?}",
                registration.key, e, registration.refresh_interval
            ),
        }
    }

    match timeout(REVOKE_TIMEOUT, client.revoke(lease)).await {
        Ok(Ok(())) => info!("Deregistered {}", registration.key),
        Ok(Err(e)) => warn!("Failed to deregister {}: {}", registration.key, e),
        Err(_) => warn!(
            "Deregistering {} timed out after {:?}, the lease will expire on its own",
            registration.key, REVOKE_TIMEOUT
        ),
    }
}

#[derive(Clone)]
struct EtcdClient {
    http: reqwest::Client,
    endpoint: String,
}

impl EtcdClient {
    fn new(endpoint: &str) -> Result<Self, RegistryError> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            endpoint: normalize_endpoint(endpoint)?,
        })
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Vec<u8>, RegistryError> {
        let resp = self
            .http
            .post(format!("{}{}", self.endpoint, path))
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RegistryError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn call<R: DeserializeOwned>(&self, path: &str, body: &Value) -> Result<R, RegistryError> {
        let bytes = self.post(path, body).await?;
        serde_json::from_slice(&bytes).map_err(|e| RegistryError::Decode(e.to_string()))
    }

    /// Grants a fresh lease and writes the record under it.
    async fn publish(&self, registration: &Registration) -> Result<i64, RegistryError> {
        let ttl = registration.ttl.as_secs().max(1);
        let grant: LeaseGrant = self.call("/v3/lease/grant", &json!({ "TTL": ttl })).await?;
        if let Some(e) = grant.error.filter(|e| !e.is_empty()) {
            return Err(RegistryError::Decode(format!("lease grant refused: {}", e)));
        }
        let lease = grant.id.0;
        if lease == 0 {
            return Err(RegistryError::Decode("lease grant returned no ID".into()));
        }

        let value = serde_json::to_vec(&registration.record)
            .map_err(|e| RegistryError::Decode(e.to_string()))?;
        let body = json!({
            "key": STANDARD.encode(registration.key.as_bytes()),
            "value": STANDARD.encode(value),
            "lease": lease.to_string(),
        });
        if let Err(e) = self.post("/v3/kv/put", &body).await {
            if let Err(revoke) = self.revoke(lease).await {
                warn!("Failed to revoke unused lease {:x}: {}", lease, revoke);
            }
            return Err(e);
        }
        Ok(lease)
    }

    /// Keeps `lease` alive, or publishes again under a new lease if it has
    /// already expired.  Returns the lease now holding the registration.
    async fn refresh(&self, registration: &Registration, lease: i64) -> Result<i64, RegistryError> {
        if self.keepalive(lease).await? > 0 {
            return Ok(lease);
        }
        warn!(
            "Lease {:x} for {} expired, registering again",
            lease, registration.key
        );
        self.publish(registration).await
    }

    /// Remaining TTL in seconds after the keepalive; 0 once the lease is gone.
    async fn keepalive(&self, lease: i64) -> Result<i64, RegistryError> {
        let bytes = self
            .post("/v3/lease/keepalive", &json!({ "ID": lease.to_string() }))
            .await?;
        parse_keepalive(&bytes)
    }

    async fn revoke(&self, lease: i64) -> Result<(), RegistryError> {
        self.post("/v3/lease/revoke", &json!({ "ID": lease.to_string() }))
            .await
            .map(drop)
    }

    /// Every key/value under `prefix`, decoded from base64.
    async fn range_prefix(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, RegistryError> {
        let (key, range_end) = prefix_range(prefix.as_bytes());
        let body = json!({
            "key": STANDARD.encode(key),
            "range_end": STANDARD.encode(range_end),
        });
        let range: RangeResponse = self.call("/v3/kv/range", &body).await?;

        range
            .kvs
            .into_iter()
            .map(|kv| -> Result<(String, Vec<u8>), RegistryError> {
                let key = decode_base64(&kv.key)?;
                let value = decode_base64(&kv.value)?;
                Ok((String::from_utf8_lossy(&key).into_owned(), value))
            })
            .collect()
    }
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>, RegistryError> {
    STANDARD
        .decode(encoded)
        .map_err(|e| RegistryError::Decode(e.to_string()))
}

/// `http://` is assumed when the endpoint has no scheme.
fn normalize_endpoint(raw: &str) -> Result<String, RegistryError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(RegistryError::Endpoint(raw.to_string()));
    }
    match trimmed.split_once("://") {
        Some(("http" | "https", rest)) if !rest.is_empty() => Ok(trimmed.to_string()),
        Some(_) => Err(RegistryError::Endpoint(raw.to_string())),
        None => Ok(format!("http://{}", trimmed)),
    }
}

/// Key and range end selecting every key that starts with `prefix`.
fn prefix_range(prefix: &[u8]) -> (Vec<u8>, Vec<u8>) {
    if prefix.is_empty() {
        return (vec![0], vec![0]);
    }
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < 0xff {
            end.push(last + 1);
            return (prefix.to_vec(), end);
        }
    }
    (prefix.to_vec(), vec![0])
}

fn parse_keepalive(bytes: &[u8]) -> Result<i64, RegistryError> {
    let message = serde_json::Deserializer::from_slice(bytes)
        .into_iter::<KeepAliveMessage>()
        .next()
        .ok_or_else(|| RegistryError::Decode("empty keepalive response".into()))?
        .map_err(|e| RegistryError::Decode(e.to_string()))?;

    match (message.result, message.error) {
        (Some(result), _) => Ok(result.ttl.0),
        (None, Some(error)) => Err(RegistryError::Decode(format!("keepalive failed: {}", error))),
        (None, None) => Ok(0),
    }
}

/// etcd's gateway encodes 64-bit integers as JSON strings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct EtcdInt(i64);

impl<'de> Deserialize<'de> for EtcdInt {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Number(i64),
            Text(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(EtcdInt(n)),
            Repr::Text(s) => s.parse().map(EtcdInt).map_err(de::Error::custom),
        }
    }
}

#[derive(Debug, Deserialize)]
struct LeaseGrant {
    #[serde(rename = "ID", default)]
    id: EtcdInt,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveMessage {
    #[serde(default)]
    result: Option<KeepAliveResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct KeepAliveResult {
    #[serde(rename = "TTL", default)]
    ttl: EtcdInt,
}

#[derive(Debug, Deserialize)]
struct RangeResponse {
    #[serde(default)]
    kvs: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct KeyValue {
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
}
