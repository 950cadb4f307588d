use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

use gather_core::{ProgressConfig, QueueConfig, TaskService};
use gather_db::{JobRepository, TaskRepository};

/// Task service over the PostgreSQL backend.
pub type PgTaskService = TaskService<TaskRepository, TaskRepository, JobRepository>;

/// Shared application state for all handlers.
///
/// Axum clones this for every request; the repositories hold the pool
/// behind an `Arc`, so clones are cheap.
#[derive(Clone)]
pub struct AppState {
    /// Submission, status and operator actions
    pub task_service: PgTaskService,

    /// Pool used for health checks
    pub pool: PgPool,

    /// Cancellation token for graceful shutdown
    pub shutdown_token: CancellationToken,
}

impl AppState {
    pub fn new(
        pool: PgPool,
        queue_config: QueueConfig,
        progress_config: ProgressConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        let tasks = TaskRepository::new(pool.clone());
        let max_attempts = queue_config.max_attempts;
        let jobs = JobRepository::with_config(pool.clone(), queue_config);

        Self {
            task_service: TaskService::new(tasks.clone(), tasks, jobs)
                .with_progress(progress_config)
                .with_max_attempts(max_attempts),
            pool,
            shutdown_token,
        }
    }
}
