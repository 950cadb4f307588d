//! Response DTOs for API endpoints.

use chrono::{DateTime, Utc};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use gather_core::{
    Group, Job, PhaseProgress, StartNowOutcome, Task, TaskError, TaskMetrics, TaskStatus,
    TaskStatusView,
};

// =============================================================================
// Health
// =============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Health status ("healthy" or "degraded")
    pub status: String,
    /// Server version
    pub version: String,
    /// Database connectivity status
    pub database: ServiceStatus,
}

/// Status of an individual service component.
#[derive(Debug, Serialize, ToSchema)]
pub struct ServiceStatus {
    /// Whether the service is reachable
    pub healthy: bool,
    /// Optional message (e.g., error details)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// =============================================================================
// Tasks
// =============================================================================

/// Response to an accepted submission.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskAcceptedResponse {
    pub task_id: Uuid,
    /// Always "pending" for a fresh task
    pub status: String,
    /// Group ids after deduplication
    pub group_ids: Vec<String>,
    /// Where to poll for progress
    pub status_url: String,
    pub created_at: DateTime<Utc>,
}

impl From<Task> for TaskAcceptedResponse {
    fn from(task: Task) -> Self {
        Self {
            status_url: format!("/api/v1/tasks/{}", task.id),
            task_id: task.id,
            status: task.status.to_string(),
            group_ids: task.group_ids,
            created_at: task.created_at,
        }
    }
}

/// Overall progress on a 0-100 scale.
#[derive(Debug, Serialize, ToSchema)]
pub struct ProgressDto {
    pub percentage: u8,
    pub processed: u64,
    pub total: u64,
}

/// Progress of one phase of the collection.
#[derive(Debug, Serialize, ToSchema)]
pub struct PhaseDto {
    /// groups, posts or comments
    pub phase: String,
    /// Share of the overall percentage owned by this phase
    pub weight: u64,
    pub processed: u64,
    pub total: u64,
    /// Whether `total` is an estimate
    pub estimated: bool,
    pub completed: bool,
}

impl From<&PhaseProgress> for PhaseDto {
    fn from(p: &PhaseProgress) -> Self {
        Self {
            phase: p.phase.to_string(),
            weight: p.weight,
            processed: p.processed,
            total: p.total,
            estimated: p.estimated,
            completed: p.completed,
        }
    }
}

/// Raw counters of a task.
#[derive(Debug, Serialize, ToSchema)]
pub struct MetricsDto {
    pub groups_total: u64,
    pub groups_processed: u64,
    pub posts_total: u64,
    pub posts_processed: u64,
    pub comments_total: u64,
    pub comments_processed: u64,
    pub estimated_comments_per_post: f64,
    pub posts_total_exact: bool,
    pub comments_total_exact: bool,
}

impl From<TaskMetrics> for MetricsDto {
    fn from(m: TaskMetrics) -> Self {
        Self {
            groups_total: m.groups_total,
            groups_processed: m.groups_processed,
            posts_total: m.posts_total,
            posts_processed: m.posts_processed,
            comments_total: m.comments_total,
            comments_processed: m.comments_processed,
            estimated_comments_per_post: m.estimated_comments_per_post,
            posts_total_exact: m.posts_total_exact,
            comments_total_exact: m.comments_total_exact,
        }
    }
}

/// An error recorded against a task.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskErrorDto {
    /// group, post, comment or task
    pub scope: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl From<TaskError> for TaskErrorDto {
    fn from(e: TaskError) -> Self {
        Self {
            scope: e.scope.as_str().to_string(),
            external_id: e.external_id,
            message: e.message,
            occurred_at: e.occurred_at,
        }
    }
}

/// A group resolved by the collection.
#[derive(Debug, Serialize, ToSchema)]
pub struct GroupDto {
    pub id: String,
    pub name: String,
    pub member_count: Option<u64>,
    pub privacy: Option<String>,
}

impl From<Group> for GroupDto {
    fn from(g: Group) -> Self {
        Self {
            id: g.external_id,
            name: g.name,
            member_count: g.member_count,
            privacy: g.privacy,
        }
    }
}

/// Status of a collection task as seen by polling clients.
#[derive(Debug, Serialize, ToSchema)]
pub struct TaskStatusResponse {
    pub task_id: Uuid,
    /// pending, processing, completed, failed or cancelled
    pub status: String,
    /// Phase currently being worked on
    pub phase: String,
    pub progress: ProgressDto,
    pub phases: Vec<PhaseDto>,
    pub metrics: MetricsDto,
    pub errors: Vec<TaskErrorDto>,
    pub groups: Vec<GroupDto>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl From<TaskStatusView> for TaskStatusResponse {
    fn from(view: TaskStatusView) -> Self {
        Self {
            task_id: view.task_id,
            status: view.status.to_string(),
            phase: view.phase.to_string(),
            progress: ProgressDto {
                percentage: view.progress.percentage,
                processed: view.progress.processed,
                total: view.progress.total,
            },
            phases: view.phases.iter().map(PhaseDto::from).collect(),
            metrics: view.metrics.into(),
            errors: view.errors.into_iter().map(Into::into).collect(),
            groups: view.groups.into_iter().map(Into::into).collect(),
            cancel_requested: view.cancel_requested,
            created_at: view.created_at,
            updated_at: view.updated_at,
            started_at: view.started_at,
            finished_at: view.finished_at,
        }
    }
}

/// Response to a cancellation request.
#[derive(Debug, Serialize, ToSchema)]
pub struct CancelResponse {
    pub task_id: Uuid,
    /// Status after the request; "processing" means the worker stops at its
    /// next checkpoint
    pub status: String,
}

impl CancelResponse {
    pub fn new(task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            task_id,
            status: status.to_string(),
        }
    }
}

/// Response to a start-now request.
#[derive(Debug, Serialize, ToSchema)]
pub struct StartResponse {
    pub task_id: Uuid,
    /// prioritized, enqueued, already_running or already_finished
    pub outcome: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job: Option<JobResponse>,
    /// Terminal status when the task had already finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl StartResponse {
    pub fn new(task_id: Uuid, outcome: StartNowOutcome) -> Self {
        let (outcome, job, status) = match outcome {
            StartNowOutcome::Prioritized(job) => ("prioritized", Some(job.into()), None),
            StartNowOutcome::Enqueued(job) => ("enqueued", Some(job.into()), None),
            StartNowOutcome::AlreadyRunning(job) => ("already_running", Some(job.into()), None),
            StartNowOutcome::AlreadyFinished(status) => {
                ("already_finished", None, Some(status.to_string()))
            }
        };
        Self {
            task_id,
            outcome: outcome.to_string(),
            job,
            status,
        }
    }

    /// Whether the request changed the queue.
    pub fn is_accepted(&self) -> bool {
        matches!(self.outcome.as_str(), "prioritized" | "enqueued")
    }
}

// =============================================================================
// Jobs
// =============================================================================

/// A job in the collection queue.
#[derive(Debug, Serialize, ToSchema)]
pub struct JobResponse {
    pub id: Uuid,
    pub task_id: Uuid,
    /// waiting, active, completed or dead
    pub state: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub priority: i16,
    pub next_eligible_at: DateTime<Utc>,
    pub visibility_deadline: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobResponse {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            task_id: job.task_id,
            state: job.state.as_str().to_string(),
            attempt: job.attempt,
            max_attempts: job.max_attempts,
            priority: job.priority,
            next_eligible_at: job.next_eligible_at,
            visibility_deadline: job.visibility_deadline,
            worker_id: job.worker_id,
            last_error: job.last_error,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

/// Jobs in one state.
#[derive(Debug, Serialize, ToSchema)]
pub struct JobListResponse {
    pub state: String,
    /// Number of jobs in the state, not only the ones returned
    pub count: u64,
    pub jobs: Vec<JobResponse>,
}
