use crate::types::WorkloadInfo;
use anyhow::Result;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait WorkloadRuntime: Send + Sync {
    /// List the workloads currently running on this host.
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>>;
}
