//! Task service: submission, status projection and operator actions.
//!
//! This is the surface both the HTTP server and the CLI drive. It never runs
//! the pipeline itself; dispatch always goes through the job queue.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobState};
use crate::job_queue::JobQueue;
use crate::models::Group;
use crate::progress::{Phase, PhaseProgress, ProgressCalculator, ProgressConfig};
use crate::task::{NewTask, Task, TaskError, TaskMetrics, TaskOptions, TaskStatus};
use crate::traits::{ResultStore, TaskStore};

/// Overall progress of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProgressView {
    pub percentage: u8,
    pub processed: u64,
    pub total: u64,
}

/// Read model returned to polling clients.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskStatusView {
    pub task_id: Uuid,
    pub status: TaskStatus,
    pub phase: Phase,
    pub progress: ProgressView,
    /// Raw per-phase detail, including whether totals are estimates.
    pub phases: [PhaseProgress; 3],
    pub metrics: TaskMetrics,
    pub errors: Vec<TaskError>,
    pub groups: Vec<Group>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Result of [`TaskService::start_now`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartNowOutcome {
    /// The waiting job moved to the front of the queue.
    Prioritized(Job),
    /// The task had no live job; a new one was enqueued at the front.
    Enqueued(Job),
    /// A worker is already running the task.
    AlreadyRunning(Job),
    /// Nothing to start.
    AlreadyFinished(TaskStatus),
}

/// Submission and inspection of collection tasks.
#[derive(Clone)]
pub struct TaskService<S, R, Q>
where
    S: TaskStore,
    R: ResultStore,
    Q: JobQueue,
{
    tasks: S,
    results: R,
    queue: Q,
    progress: ProgressConfig,
    max_attempts: u32,
}

impl<S, R, Q> TaskService<S, R, Q>
where
    S: TaskStore,
    R: ResultStore,
    Q: JobQueue,
{
    pub fn new(tasks: S, results: R, queue: Q) -> Self {
        Self {
            tasks,
            results,
            queue,
            progress: ProgressConfig::default(),
            max_attempts: 3,
        }
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }

    /// Attempts given to jobs enqueued by this service.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Creates a task and enqueues its job in one atomic step.
    ///
    /// # Errors
    ///
    /// `InvalidInput` when no usable group id remains after deduplication,
    /// `StoreUnavailable` when the backend is down. Nothing is created then.
    pub async fn submit<I, T>(&self, group_ids: I, options: TaskOptions) -> Result<Task, AppError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let mut new_task = NewTask::new(group_ids)?;
        if let Some(max) = options.max_comments {
            new_task = new_task.with_max_comments(max);
        }
        if let Some(estimate) = options.estimated_comments_per_post {
            new_task = new_task.with_estimated_comments_per_post(estimate)?;
        }

        let (task, job) = self.tasks.create_task(new_task, self.max_attempts).await?;
        info!(
            task_id = %task.id,
            job_id = %job.id,
            groups = task.group_ids.len(),
            "Task submitted"
        );
        Ok(task)
    }

    /// Projects a task into its status view.
    ///
    /// The percentage never drops below the highest value ever persisted, and
    /// a completed task always reports 100.
    pub async fn get_status(&self, task_id: Uuid) -> Result<TaskStatusView, AppError> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or(AppError::TaskNotFound(task_id))?;
        let groups = self.results.list_groups(task_id).await?;

        let calculator = ProgressCalculator::new(self.progress.for_task(&task.options));
        let mut snapshot = calculator.calculate(&task.metrics).at_least(task.progress);
        if task.status == TaskStatus::Completed {
            snapshot = snapshot.finished();
        }

        Ok(TaskStatusView {
            task_id: task.id,
            status: task.status,
            phase: snapshot.phase,
            progress: ProgressView {
                percentage: snapshot.percentage,
                processed: snapshot.processed,
                total: snapshot.total,
            },
            phases: snapshot.phases,
            metrics: task.metrics,
            errors: task.errors,
            groups,
            cancel_requested: task.cancel_requested,
            created_at: task.created_at,
            updated_at: task.updated_at,
            started_at: task.started_at,
            finished_at: task.finished_at,
        })
    }

    /// Requests cancellation. Idempotent; returns the resulting status.
    pub async fn cancel(&self, task_id: Uuid) -> Result<TaskStatus, AppError> {
        let status = self.tasks.request_cancel(task_id).await?;
        info!(%task_id, %status, "Cancellation requested");
        Ok(status)
    }

    /// Forces a task to start as soon as a worker is free.
    ///
    /// Idempotent: a running task is left alone, a waiting job is moved to
    /// the front, and a pending task whose job is gone or dead gets a new one.
    pub async fn start_now(&self, task_id: Uuid) -> Result<StartNowOutcome, AppError> {
        let task = self
            .tasks
            .get_task(task_id)
            .await?
            .ok_or(AppError::TaskNotFound(task_id))?;
        if task.status.is_terminal() {
            return Ok(StartNowOutcome::AlreadyFinished(task.status));
        }

        if let Some(job) = self.queue.find_by_task(task_id).await? {
            match job.state {
                JobState::Active => return Ok(StartNowOutcome::AlreadyRunning(job)),
                JobState::Waiting => {
                    if let Some(job) = self.queue.prioritize(task_id).await? {
                        info!(%task_id, job_id = %job.id, "Job prioritized");
                        return Ok(StartNowOutcome::Prioritized(job));
                    }
                    // Delivered between the two calls.
                    if let Some(job) = self.queue.find_by_task(task_id).await? {
                        if job.state == JobState::Active {
                            return Ok(StartNowOutcome::AlreadyRunning(job));
                        }
                    }
                }
                JobState::Completed | JobState::Dead => {}
            }
        }

        self.queue.enqueue(task_id, self.max_attempts).await?;
        let job = self
            .queue
            .prioritize(task_id)
            .await?
            .ok_or_else(|| AppError::Generic(format!("job for task {} vanished", task_id)))?;
        info!(%task_id, job_id = %job.id, "Job re-enqueued");
        Ok(StartNowOutcome::Enqueued(job))
    }

    /// Jobs in `state`, oldest first.
    pub async fn list_jobs(&self, state: JobState, limit: usize) -> Result<Vec<Job>, AppError> {
        self.queue.list_by_state(state, limit).await
    }

    /// Number of jobs in `state`.
    pub async fn count_jobs(&self, state: JobState) -> Result<u64, AppError> {
        self.queue.count_by_state(state).await
    }
}
