use std::time::Instant;

use axum::extract::State;
use axum::Json;
use log::{info, warn};

use super::AppState;
use crate::error::ApiError;
use crate::types::HostStatus;

// GET /status/local
pub async fn local_status(State(ctx): State<AppState>) -> Result<Json<HostStatus>, ApiError> {
    let started = Instant::now();
    let mut workloads = match ctx.runtime.list_workloads().await {
        Ok(workloads) => workloads,
        Err(e) => {
            warn!("GET /status/local failed in {:?}: {:#}", started.elapsed(), e);
            return Err(ApiError::Workload(e));
        }
    };

    // Host port mappings stay on this host.
    for workload in &mut workloads {
        workload.strip_exposed_ports();
    }

    info!("GET /status/local in {:?}", started.elapsed());
    Ok(Json(HostStatus::workloads(workloads)))
}
