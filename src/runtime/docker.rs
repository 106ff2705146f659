use super::WorkloadRuntime;
use crate::types::WorkloadInfo;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use log::debug;
use serde_json::Value;

pub struct DockerRuntime {
    docker: Docker,
    show_size: bool,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles the unix socket on Linux and `DOCKER_HOST` when set.
    pub fn connect(show_size: bool) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker, show_size })
    }
}

#[async_trait]
impl WorkloadRuntime for DockerRuntime {
    async fn list_workloads(&self) -> Result<Vec<WorkloadInfo>> {
        let opts = ListContainersOptions::<String> {
            all: false,
            size: self.show_size,
            ..Default::default()
        };
        let containers = self.docker.list_containers(Some(opts)).await?;
        debug!("Docker reported {} running containers", containers.len());

        containers.into_iter().map(to_workload).collect()
    }
}

/// Containers are relayed with the field names the Docker API uses.
fn to_workload(container: ContainerSummary) -> Result<WorkloadInfo> {
    match serde_json::to_value(container)? {
        Value::Object(fields) => Ok(WorkloadInfo::new(fields)),
        other => Err(anyhow!("container summary encoded as {}", other)),
    }
}
