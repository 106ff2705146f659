//! Node registration and peer discovery.
//!
//! A [`Registry`] publishes this node under its key, keeps the entry alive
//! while the process runs and lists the entries other nodes published under
//! the same parent.  The handle is created once in `main` and shared with the
//! HTTP handlers, which only ever call [`Registry::list_peers`].

use async_trait::async_trait;

use crate::error::RegistryError;
use crate::types::PeerRecord;

pub mod etcd;
pub use etcd::{EtcdRegistry, Registration};

#[async_trait]
pub trait Registry: Send + Sync {
    /// Publish the registration and start refreshing it in the background.
    /// Returns the outcome of the first publish.
    async fn start(&self) -> Result<(), RegistryError>;

    /// Ask the refresh loop to stop and deregister.  Does not block.
    fn stop(&self);

    /// Wait until the refresh loop has exited after [`Registry::stop`].
    async fn wait(&self);

    /// Entries currently live under `prefix`, read from the registry itself.
    async fn list_peers(&self, prefix: &str) -> Result<Vec<PeerRecord>, RegistryError>;
}

/// Prefix shared by this node and its peers: the parent "directory" of the
/// node key, including the trailing `/`.  A key without `/` has an empty
/// prefix, which lists everything.
pub fn key_prefix(key: &str) -> String {
    match key.rfind('/') {
        Some(idx) => key[..=idx].to_string(),
        None => String::new(),
    }
}
