//! Node agent reporting the containers running on its host, and on every
//! peer registered next to it in etcd.

pub mod config;
pub mod error;
pub mod lookup;
pub mod registry;
pub mod runtime;
pub mod server;
pub mod types;
