//! OpenAPI documentation configuration.

use utoipa::OpenApi;

use crate::dto::{
    CancelResponse, GroupDto, HealthResponse, JobListResponse, JobResponse, JobsQuery,
    MetricsDto, PhaseDto, ProgressDto, ServiceStatus, StartResponse, SubmitTaskRequest,
    TaskAcceptedResponse, TaskErrorDto, TaskStatusResponse,
};
use crate::handlers::{health, jobs, tasks};

/// OpenAPI documentation for the Gather API.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Gather API",
        version = "1.0.0",
        description = "Durable collection of groups, posts and comments from a social platform API.

Submitting a task returns immediately; a worker pool drains the job queue and
reports progress on a single 0-100 scale weighted across the groups, posts and
comments phases.

## Quick Start

1. Submit a task: `POST /api/v1/tasks` with `{\"group_ids\": [\"123\"]}`
2. Poll progress: `GET /api/v1/tasks/{id}`
3. Inspect the queue: `GET /api/v1/jobs?state=waiting`
",
        license(
            name = "Apache-2.0",
            url = "https://www.apache.org/licenses/LICENSE-2.0"
        )
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        health::health_check,
        tasks::submit_task,
        tasks::get_task_status,
        tasks::cancel_task,
        tasks::start_task,
        jobs::list_jobs,
    ),
    components(
        schemas(
            // Request types
            SubmitTaskRequest,
            JobsQuery,
            // Response types
            HealthResponse,
            ServiceStatus,
            TaskAcceptedResponse,
            TaskStatusResponse,
            ProgressDto,
            PhaseDto,
            MetricsDto,
            TaskErrorDto,
            GroupDto,
            CancelResponse,
            StartResponse,
            JobResponse,
            JobListResponse,
        )
    ),
    tags(
        (name = "system", description = "System health"),
        (name = "tasks", description = "Collection task submission and tracking"),
        (name = "jobs", description = "Job queue inspection"),
    )
)]
pub struct ApiDoc;
