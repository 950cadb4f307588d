//! Job queue inspection.

use axum::{
    Json,
    extract::{Query, State},
};

use crate::dto::{JobListResponse, JobResponse, JobsQuery};
use crate::error::ApiError;
use crate::state::AppState;

/// List jobs in a given state, oldest first.
#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    params(JobsQuery),
    responses(
        (status = 200, description = "Jobs in the requested state", body = JobListResponse),
        (status = 400, description = "Unknown job state"),
    ),
    tag = "jobs"
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let (job_state, limit) = query.parse()?;

    let jobs = state.task_service.list_jobs(job_state, limit).await?;
    let count = state.task_service.count_jobs(job_state).await?;

    Ok(Json(JobListResponse {
        state: job_state.as_str().to_string(),
        count,
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
    }))
}
