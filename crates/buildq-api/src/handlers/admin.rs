//! Administration handlers: inspect and steer the scheduler.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use buildq_core::ids::BuildId;
use buildq_core::protocol::BuildStatus;
use buildq_scheduler::{BuildInfo, WorkerInfo};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::api_error;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ListBuildsParams {
    /// Include per-task details.
    #[serde(default)]
    pub tasks: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListBuildsResponse {
    pub builds: Vec<BuildInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListWorkersResponse {
    pub workers: Vec<WorkerInfo>,
    pub total: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelBuildResponse {
    pub build_id: BuildId,
    pub status: BuildStatus,
}

pub async fn list_builds(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListBuildsParams>,
) -> Json<ListBuildsResponse> {
    let builds = state.scheduler.list_builds(params.tasks);
    let total = builds.len();
    Json(ListBuildsResponse { builds, total })
}

pub async fn cancel_build(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<CancelBuildResponse>, (StatusCode, String)> {
    let build_id: BuildId = id.parse().map_err(api_error)?;
    state.scheduler.cancel_build(&build_id).map_err(api_error)?;
    info!(build_id = %build_id, "Build cancelled by administrator");
    Ok(Json(CancelBuildResponse {
        build_id,
        status: BuildStatus::Cancelled,
    }))
}

pub async fn list_workers(State(state): State<Arc<AppState>>) -> Json<ListWorkersResponse> {
    let workers = state.scheduler.list_workers();
    let total = workers.len();
    Json(ListWorkersResponse { workers, total })
}

pub async fn reschedule(State(state): State<Arc<AppState>>) -> StatusCode {
    state.scheduler.reschedule();
    StatusCode::ACCEPTED
}
