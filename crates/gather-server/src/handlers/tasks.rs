//! Collection task endpoints.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use uuid::Uuid;

use crate::dto::{
    CancelResponse, StartResponse, SubmitTaskRequest, TaskAcceptedResponse, TaskStatusResponse,
};
use crate::error::ApiError;
use crate::state::AppState;

/// Submit a collection task.
///
/// The task and its job are created together; the response returns as soon
/// as both are stored. Poll the status URL for progress.
#[utoipa::path(
    post,
    path = "/api/v1/tasks",
    request_body = SubmitTaskRequest,
    responses(
        (status = 202, description = "Task accepted", body = TaskAcceptedResponse),
        (status = 400, description = "No usable group id or invalid options"),
        (status = 503, description = "Task store unavailable"),
    ),
    tag = "tasks"
)]
pub async fn submit_task(
    State(state): State<AppState>,
    Json(request): Json<SubmitTaskRequest>,
) -> Result<(StatusCode, Json<TaskAcceptedResponse>), ApiError> {
    let options = request.validate()?;

    let task = state
        .task_service
        .submit(&request.group_ids, options)
        .await?;

    Ok((StatusCode::ACCEPTED, Json(task.into())))
}

/// Get the status and progress of a task.
#[utoipa::path(
    get,
    path = "/api/v1/tasks/{id}",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 200, description = "Task status", body = TaskStatusResponse),
        (status = 404, description = "Task not found"),
        (status = 503, description = "Task store unavailable"),
    ),
    tag = "tasks"
)]
pub async fn get_task_status(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<TaskStatusResponse>, ApiError> {
    let view = state.task_service.get_status(id).await?;
    Ok(Json(view.into()))
}

/// Request cancellation of a task.
///
/// A pending task is cancelled at once. A processing task stops at the
/// worker's next checkpoint. Finished tasks are left as they are.
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/cancel",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 202, description = "Cancellation recorded", body = CancelResponse),
        (status = 404, description = "Task not found"),
    ),
    tag = "tasks"
)]
pub async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<CancelResponse>), ApiError> {
    let status = state.task_service.cancel(id).await?;
    Ok((StatusCode::ACCEPTED, Json(CancelResponse::new(id, status))))
}

/// Start a task as soon as a worker is free.
///
/// Moves the task's job to the front of the queue, or enqueues a new one
/// when the previous job is gone. Repeating the call is harmless.
#[utoipa::path(
    post,
    path = "/api/v1/tasks/{id}/start",
    params(("id" = Uuid, Path, description = "Task id")),
    responses(
        (status = 202, description = "Job queued at the front", body = StartResponse),
        (status = 200, description = "Task already running or finished", body = StartResponse),
        (status = 404, description = "Task not found"),
    ),
    tag = "tasks"
)]
pub async fn start_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<StartResponse>), ApiError> {
    let outcome = state.task_service.start_now(id).await?;
    let response = StartResponse::new(id, outcome);

    let status = if response.is_accepted() {
        StatusCode::ACCEPTED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(response)))
}
