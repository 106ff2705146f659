use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use nix::unistd::gethostname;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lookup::local_outbound_address;
use crate::registry::{key_prefix, Registration};
use crate::types::PeerRecord;

pub const ENV_PREFIX: &str = "PEERSTAT_";

/// Settings as read from defaults, files, environment and flags.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub registry_url: String,
    /// Registration key template: `%H` is replaced by the hostname, `%P` by
    /// the listen port and `%%` by a literal `%`.
    pub key: String,
    /// 0 picks a free port at startup.
    pub port: u16,
    pub listen_host: IpAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    pub ipv4_only: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub advertise_host: Option<String>,
    pub ttl_secs: u64,
    pub refresh_interval_secs: u64,
    pub peer_timeout_ms: u64,
    pub max_concurrent_peers: usize,
    pub show_size: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            registry_url: String::new(),
            key: "services/peerstat/%H-%P".into(),
            port: 0,
            listen_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            interface: None,
            ipv4_only: true,
            advertise_host: None,
            ttl_secs: 300,
            refresh_interval_secs: 60,
            peer_timeout_ms: 5_000,
            max_concurrent_peers: 64,
            show_size: false,
        }
    }
}

/// Command-line flags.  Flags that are not given leave the other sources
/// untouched.
#[derive(Debug, Clone, Default, Parser, Serialize)]
#[command(version, about = "Reports the containers running on this host and on its peers")]
pub struct Cli {
    /// URL of the etcd endpoint to register with
    #[arg(long = "registry", alias = "etcd")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry_url: Option<String>,

    /// Key to register under; %H is the hostname, %P the port
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Port to listen on, or 0 to pick a free one
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    /// Interface used to pick a free port
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,

    /// Additional TOML configuration file
    #[arg(long)]
    #[serde(skip)]
    pub config: Option<PathBuf>,
}

impl Config {
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        // --config takes the place of peerstat.toml.
        let toml = match &cli.config {
            Some(path) => Toml::file(path),
            None => Toml::file("peerstat.toml"),
        };
        let config: Config = Figment::from(Serialized::defaults(Config::default()))
            .merge(toml)
            .merge(Json::file("peerstat.json"))
            .merge(Env::prefixed(ENV_PREFIX))
            .merge(Serialized::defaults(cli))
            .extract()?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.registry_url.trim().is_empty() {
            return Err(ConfigError::Missing("registry_url"));
        }
        if self.key.trim().is_empty() {
            return Err(ConfigError::Missing("key"));
        }
        if self.ttl_secs == 0 {
            return Err(invalid("ttl_secs", "must be at least 1 second"));
        }
        if self.refresh_interval_secs == 0 {
            return Err(invalid("refresh_interval_secs", "must be at least 1 second"));
        }
        // A refresh that does not come before the TTL lets the
        // registration lapse between refreshes.
        if self.refresh_interval_secs >= self.ttl_secs {
            return Err(ConfigError::RefreshInterval {
                refresh_secs: self.refresh_interval_secs,
                ttl_secs: self.ttl_secs,
            });
        }
        if self.peer_timeout_ms == 0 {
            return Err(invalid("peer_timeout_ms", "must be positive"));
        }
        if self.max_concurrent_peers == 0 {
            return Err(invalid("max_concurrent_peers", "must be positive"));
        }
        Ok(())
    }

    /// Resolves everything that depends on the host: the hostname, the
    /// registration key and the advertised address.  `port` is the port the
    /// server will actually listen on.
    pub async fn populate(self, port: u16) -> Result<NodeConfig, ConfigError> {
        self.validate()?;
        if port == 0 {
            return Err(invalid("port", "listen port must be resolved before populating"));
        }

        let hostname = gethostname()
            .map_err(ConfigError::Hostname)?
            .to_string_lossy()
            .into_owned();
        let key = expand_key(&self.key, &hostname, port);
        let host = match self
            .advertise_host
            .as_deref()
            .map(str::trim)
            .filter(|host| !host.is_empty())
        {
            Some(host) => host.to_string(),
            None => local_outbound_address(&self.registry_url).await?.to_string(),
        };

        Ok(NodeConfig {
            key_prefix: key_prefix(&key),
            key,
            hostname,
            host,
            port,
            listen: SocketAddr::new(self.listen_host, port),
            registry_url: self.registry_url,
            ttl: Duration::from_secs(self.ttl_secs),
            refresh_interval: Duration::from_secs(self.refresh_interval_secs),
            peer_timeout: Duration::from_millis(self.peer_timeout_ms),
            max_concurrent_peers: self.max_concurrent_peers,
            show_size: self.show_size,
        })
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

/// Fully resolved settings; fixed for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub registry_url: String,
    pub hostname: String,
    pub key: String,
    pub key_prefix: String,
    /// Host published to the registry.
    pub host: String,
    pub port: u16,
    pub listen: SocketAddr,
    pub ttl: Duration,
    pub refresh_interval: Duration,
    pub peer_timeout: Duration,
    pub max_concurrent_peers: usize,
    pub show_size: bool,
}

impl NodeConfig {
    pub fn registration(&self) -> Registration {
        Registration {
            key: self.key.clone(),
            record: PeerRecord::new(self.host.clone(), self.port),
            ttl: self.ttl,
            refresh_interval: self.refresh_interval,
        }
    }
}

/// Expands the key template in one pass, so placeholders inside the
/// substituted values are left alone.
pub fn expand_key(template: &str, hostname: &str, port: u16) -> String {
    let mut key = String::with_capacity(template.len() + hostname.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            key.push(c);
            continue;
        }
        match chars.next() {
            Some('H') => key.push_str(hostname),
            Some('P') => key.push_str(&port.to_string()),
            Some('%') => key.push('%'),
            Some(other) => {
                key.push('%');
                key.push(other);
            }
            None => key.push('%'),
        }
    }
    key
}
