//! Worker service for processing collection jobs from the queue.
//!
//! # Architecture
//!
//! The worker follows a poll-based model:
//! ```text
//! loop {
//!     1. Check for shutdown
//!     2. Reap jobs whose visibility deadline passed; fail tasks of dead ones
//!     3. Dequeue the next eligible job
//!     4. Run the pipeline, extending the job's visibility on every heartbeat
//!     5. Ack, fail or release the job and finish its task
//!     6. If no jobs are available, sleep for poll_interval
//! }
//! ```
//!
//! # Outcomes
//!
//! | pipeline result              | task        | job                            |
//! |------------------------------|-------------|--------------------------------|
//! | completed                    | `completed` | ack                            |
//! | cancelled                    | `cancelled` | ack                            |
//! | interrupted (shutdown)       | unchanged   | release (attempt not counted)  |
//! | fatal error                  | `failed`    | ack                            |
//! | retryable error              | unchanged   | fail → retry, or dead → `failed` |
//! | other error                  | `failed`    | fail → dead                    |
//! | lease lost                   | unchanged   | left to its new holder         |
//!
//! A task is written before its job is acked. When that write fails the job
//! is failed instead and redelivered, so the write is attempted again. Dead
//! jobs whose task was never failed are picked up by the reaping step.
//!
//! # Example
//!
//! ```ignore
//! use gather_core::worker::{WorkerService, TracingWorkerReporter};
//! use gather_core::{TracingReporter, WorkerConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let worker = WorkerService::new(job_queue, collection_service, WorkerConfig::default());
//! let shutdown = CancellationToken::new();
//!
//! worker.run(shutdown, &TracingWorkerReporter, &TracingReporter).await?;
//! ```

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collector::CollectionService;
use crate::error::AppError;
use crate::job::{Job, WorkerConfig};
use crate::job_queue::{FailOutcome, JobQueue, ReapOutcome};
use crate::reporter::ProgressReporter;
use crate::stats::{CollectionResult, CollectionStats, CollectionStatus};
use crate::task::{Task, TaskError, TaskStatus};
use crate::traits::{PlatformClient, ResultStore, TaskStore};

// =============================================================================
// Worker Events
// =============================================================================

/// Events emitted by the worker during operation.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    /// Worker started and is ready to process jobs.
    Started { worker_id: &'a str },
    /// Worker is polling for new jobs.
    Polling,
    /// Expired jobs were reclaimed.
    JobsReaped { redelivered: u64, dead: usize },
    /// Worker claimed a job.
    JobClaimed { job: &'a Job },
    /// Job completed successfully.
    JobCompleted {
        job_id: Uuid,
        stats: &'a CollectionStats,
    },
    /// Job failed with error.
    JobFailed {
        job_id: Uuid,
        error: &'a str,
        will_retry: bool,
    },
    /// The task was cancelled and its job acked.
    JobCancelled {
        job_id: Uuid,
        stats: &'a CollectionStats,
    },
    /// Job handed back to the queue on shutdown.
    JobReleased { job_id: Uuid },
    /// Another worker holds the job now; the execution was abandoned.
    LeaseLost { job_id: Uuid },
    /// Worker is shutting down.
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    /// Worker stopped.
    Stopped { worker_id: &'a str },
}

// =============================================================================
// Worker Reporter Trait
// =============================================================================

/// Trait for reporting worker events.
///
/// Similar to [`ProgressReporter`] but for worker-level events.
pub trait WorkerReporter: Send + Sync {
    /// Called when a worker event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Silent worker reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentWorkerReporter;

impl WorkerReporter for SilentWorkerReporter {}

/// Tracing-based worker reporter for CLI/server logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id } => {
                info!(worker_id, "Worker started");
            }
            WorkerEvent::Polling => {
                // Debug level to avoid spam
                debug!("Polling for jobs...");
            }
            WorkerEvent::JobsReaped { redelivered, dead } => {
                warn!(redelivered, dead, "Reclaimed jobs past their visibility deadline");
            }
            WorkerEvent::JobClaimed { job } => {
                info!(
                    job_id = %job.id,
                    task_id = %job.task_id,
                    attempt = job.attempt,
                    max_attempts = job.max_attempts,
                    "Job claimed"
                );
            }
            WorkerEvent::JobCompleted { job_id, stats } => {
                info!(
                    %job_id,
                    groups = stats.groups,
                    posts = stats.posts,
                    comments = stats.comments,
                    failed = stats.failed,
                    "Job completed"
                );
            }
            WorkerEvent::JobFailed {
                job_id,
                error,
                will_retry,
            } => {
                if will_retry {
                    warn!(%job_id, %error, "Job failed, will retry");
                } else {
                    error!(%job_id, %error, "Job permanently failed");
                }
            }
            WorkerEvent::JobCancelled { job_id, stats } => {
                info!(%job_id, collected = stats.collected(), "Job cancelled");
            }
            WorkerEvent::JobReleased { job_id } => {
                info!(%job_id, "Job released");
            }
            WorkerEvent::LeaseLost { job_id } => {
                warn!(%job_id, "Lost the job lease, abandoning execution");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                info!(worker_id, jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped { worker_id } => {
                info!(worker_id, "Worker stopped");
            }
        }
    }
}

/// How the worker disposed of one delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// Task completed, job acked.
    Completed,
    /// Task cancelled, job acked.
    Cancelled,
    /// Job back in the queue for a later attempt.
    Retrying,
    /// Task failed; job acked or dead-lettered.
    Failed,
    /// Job released on shutdown.
    Released,
    /// Task already finished before the job ran; job acked.
    Skipped,
    /// Lease lost or queue unreachable; the visibility timeout takes over.
    Abandoned,
}

// =============================================================================
// Worker Service
// =============================================================================

/// Dead jobs settled per reaping step.
const UNSETTLED_BATCH: usize = 50;

/// Worker service that processes jobs from the queue.
pub struct WorkerService<Q, S, R, C>
where
    Q: JobQueue,
    S: TaskStore,
    R: ResultStore,
    C: PlatformClient,
{
    queue: Q,
    collector: CollectionService<S, R, C>,
    config: WorkerConfig,
}

impl<Q, S, R, C> WorkerService<Q, S, R, C>
where
    Q: JobQueue,
    S: TaskStore,
    R: ResultStore,
    C: PlatformClient,
{
    /// Create a new worker service.
    pub fn new(queue: Q, collector: CollectionService<S, R, C>, config: WorkerConfig) -> Self {
        Self {
            queue,
            collector,
            config,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Run the worker until `shutdown` is cancelled.
    pub async fn run<WR, PR>(
        &self,
        shutdown: CancellationToken,
        worker_reporter: &WR,
        progress_reporter: &PR,
    ) -> Result<(), AppError>
    where
        WR: WorkerReporter,
        PR: ProgressReporter,
    {
        worker_reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
        });
        let mut released = 0u64;

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.reap_expired_jobs(Utc::now()).await {
                Ok(reaped) if reaped.redelivered > 0 || !reaped.dead.is_empty() => {
                    worker_reporter.report(WorkerEvent::JobsReaped {
                        redelivered: reaped.redelivered,
                        dead: reaped.dead.len(),
                    });
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to reap expired jobs"),
            }

            worker_reporter.report(WorkerEvent::Polling);

            match self.queue.dequeue(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    worker_reporter.report(WorkerEvent::JobClaimed { job: &job });
                    let outcome = self
                        .process_job(&job, &shutdown, worker_reporter, progress_reporter)
                        .await;
                    if outcome == JobOutcome::Released {
                        released += 1;
                    }
                }
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.config.worker_id, error = %e, "Failed to dequeue job");
                    // Back off on errors
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        worker_reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });
        worker_reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
        });

        Ok(())
    }

    /// Reclaims expired jobs, then fails the tasks of dead jobs that are
    /// still open, whether they died here or in an earlier step.
    pub async fn reap_expired_jobs(&self, now: DateTime<Utc>) -> Result<ReapOutcome, AppError> {
        let outcome = self.queue.reap_expired(now).await?;

        for job in self.queue.list_unsettled_dead(UNSETTLED_BATCH).await? {
            let reason = job
                .last_error
                .as_deref()
                .unwrap_or("visibility timeout expired");
            let reason = if job.can_retry() {
                reason.to_string()
            } else {
                format!("max attempts exceeded: {}", reason)
            };
            if let Err(e) = self.fail_task(job.task_id, reason).await {
                warn!(job_id = %job.id, task_id = %job.task_id, error = %e, "Failed to fail task of dead job");
            }
        }

        Ok(outcome)
    }

    /// Process a single job by ID (for one-off execution, e.g., tests).
    ///
    /// The job must have been delivered to this worker already.
    pub async fn process_single_job<WR, PR>(
        &self,
        job_id: Uuid,
        shutdown: CancellationToken,
        worker_reporter: &WR,
        progress_reporter: &PR,
    ) -> Result<JobOutcome, AppError>
    where
        WR: WorkerReporter,
        PR: ProgressReporter,
    {
        let job = self
            .queue
            .get_job(job_id)
            .await?
            .ok_or(AppError::JobNotFound(job_id))?;

        Ok(self
            .process_job(&job, &shutdown, worker_reporter, progress_reporter)
            .await)
    }

    /// Process one delivered job.
    async fn process_job<WR, PR>(
        &self,
        job: &Job,
        shutdown: &CancellationToken,
        worker_reporter: &WR,
        progress_reporter: &PR,
    ) -> JobOutcome
    where
        WR: WorkerReporter,
        PR: ProgressReporter,
    {
        let task = match self.collector.task_store().mark_processing(job.task_id).await {
            Ok(task) => task,
            Err(e) => return self.fail_job(job, &e, worker_reporter).await,
        };

        if task.status.is_terminal() {
            debug!(job_id = %job.id, task_id = %task.id, status = %task.status, "Task already finished");
            self.ack(job, worker_reporter).await;
            return JobOutcome::Skipped;
        }

        let Some(result) = self
            .collect_with_heartbeat(job, &task, shutdown, progress_reporter)
            .await
        else {
            worker_reporter.report(WorkerEvent::LeaseLost { job_id: job.id });
            return JobOutcome::Abandoned;
        };

        match result {
            Ok(result) => match result.status {
                CollectionStatus::Completed => {
                    if let Err(e) = self
                        .finish_task(job.task_id, TaskStatus::Completed, None)
                        .await
                    {
                        return self.fail_job(job, &e, worker_reporter).await;
                    }
                    self.ack(job, worker_reporter).await;
                    worker_reporter.report(WorkerEvent::JobCompleted {
                        job_id: job.id,
                        stats: &result.stats,
                    });
                    JobOutcome::Completed
                }
                CollectionStatus::Cancelled => {
                    if let Err(e) = self
                        .finish_task(job.task_id, TaskStatus::Cancelled, None)
                        .await
                    {
                        return self.fail_job(job, &e, worker_reporter).await;
                    }
                    self.ack(job, worker_reporter).await;
                    worker_reporter.report(WorkerEvent::JobCancelled {
                        job_id: job.id,
                        stats: &result.stats,
                    });
                    JobOutcome::Cancelled
                }
                CollectionStatus::Interrupted => {
                    match self.queue.release(job.id, &self.config.worker_id).await {
                        Ok(true) => {
                            worker_reporter.report(WorkerEvent::JobReleased { job_id: job.id });
                            JobOutcome::Released
                        }
                        Ok(false) => {
                            worker_reporter.report(WorkerEvent::LeaseLost { job_id: job.id });
                            JobOutcome::Abandoned
                        }
                        Err(e) => {
                            error!(job_id = %job.id, error = %e, "Failed to release job");
                            JobOutcome::Abandoned
                        }
                    }
                }
            },
            Err(e) if e.is_fatal() => {
                let message = e.to_string();
                worker_reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &message,
                    will_retry: false,
                });
                if let Err(e) = self
                    .finish_task(job.task_id, TaskStatus::Failed, Some(TaskError::task(message)))
                    .await
                {
                    return self.fail_job(job, &e, worker_reporter).await;
                }
                self.ack(job, worker_reporter).await;
                JobOutcome::Failed
            }
            Err(e) => self.fail_job(job, &e, worker_reporter).await,
        }
    }

    /// Runs the pipeline while extending the job's visibility.
    ///
    /// Returns `None` when the lease was lost.
    async fn collect_with_heartbeat<PR: ProgressReporter>(
        &self,
        job: &Job,
        task: &Task,
        shutdown: &CancellationToken,
        progress_reporter: &PR,
    ) -> Option<Result<CollectionResult, AppError>> {
        let collect = self.collector.collect(task, shutdown, progress_reporter);
        tokio::pin!(collect);

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        heartbeat.tick().await;

        loop {
            tokio::select! {
                result = &mut collect => return Some(result),
                _ = heartbeat.tick() => {
                    match self
                        .queue
                        .extend_visibility(job.id, &self.config.worker_id)
                        .await
                    {
                        Ok(true) => debug!(job_id = %job.id, "Visibility extended"),
                        Ok(false) => return None,
                        Err(e) => warn!(job_id = %job.id, error = %e, "Heartbeat failed"),
                    }
                }
            }
        }
    }

    /// Records a failed attempt; a dead job fails its task.
    async fn fail_job<WR: WorkerReporter>(
        &self,
        job: &Job,
        error: &AppError,
        worker_reporter: &WR,
    ) -> JobOutcome {
        let message = error.to_string();
        let retryable = error.is_retryable();

        match self
            .queue
            .fail(job.id, &self.config.worker_id, retryable, &message)
            .await
        {
            Ok(FailOutcome::Retrying { next_eligible_at }) => {
                debug!(job_id = %job.id, %next_eligible_at, "Job scheduled for retry");
                worker_reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &message,
                    will_retry: true,
                });
                JobOutcome::Retrying
            }
            Ok(FailOutcome::Dead) => {
                worker_reporter.report(WorkerEvent::JobFailed {
                    job_id: job.id,
                    error: &message,
                    will_retry: false,
                });
                let reason = if retryable {
                    format!("max attempts exceeded: {}", message)
                } else {
                    message
                };
                if let Err(e) = self.fail_task(job.task_id, reason).await {
                    // Settled by the next reaping step.
                    warn!(job_id = %job.id, task_id = %job.task_id, error = %e, "Failed to fail task of dead job");
                }
                JobOutcome::Failed
            }
            Ok(FailOutcome::NotHeld) => {
                worker_reporter.report(WorkerEvent::LeaseLost { job_id: job.id });
                JobOutcome::Abandoned
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
                JobOutcome::Abandoned
            }
        }
    }

    async fn fail_task(&self, task_id: Uuid, reason: String) -> Result<(), AppError> {
        self.finish_task(task_id, TaskStatus::Failed, Some(TaskError::task(reason)))
            .await
    }

    /// Writes a terminal status. A task that already finished is left as is.
    async fn finish_task(
        &self,
        task_id: Uuid,
        status: TaskStatus,
        error: Option<TaskError>,
    ) -> Result<(), AppError> {
        match self
            .collector
            .task_store()
            .finish_task(task_id, status, error)
            .await
        {
            Ok(true) => Ok(()),
            Ok(false) => {
                debug!(%task_id, %status, "Task already finished");
                Ok(())
            }
            Err(e) => {
                error!(%task_id, %status, error = %e, "Failed to finish task");
                Err(e)
            }
        }
    }

    /// Acks a job whose task is finished. A job that cannot be acked stays
    /// active until reaped, and its redelivery is skipped.
    async fn ack<WR: WorkerReporter>(&self, job: &Job, worker_reporter: &WR) {
        match self.queue.ack(job.id, &self.config.worker_id).await {
            Ok(true) => {}
            Ok(false) => worker_reporter.report(WorkerEvent::LeaseLost { job_id: job.id }),
            Err(e) => error!(job_id = %job.id, error = %e, "Failed to ack job"),
        }
    }
}

// =============================================================================
// Worker Pool
// =============================================================================

/// Runs several workers over the same queue.
///
/// Worker `n` gets the id `{prefix}-{n}`, where the prefix is the configured
/// worker id.
pub struct WorkerPool<Q, S, R, C>
where
    Q: JobQueue,
    S: TaskStore,
    R: ResultStore,
    C: PlatformClient,
{
    queue: Q,
    collector: CollectionService<S, R, C>,
    config: WorkerConfig,
    pool_size: usize,
}

impl<Q, S, R, C> WorkerPool<Q, S, R, C>
where
    Q: JobQueue + 'static,
    S: TaskStore + 'static,
    R: ResultStore + 'static,
    C: PlatformClient + 'static,
{
    pub fn new(
        queue: Q,
        collector: CollectionService<S, R, C>,
        config: WorkerConfig,
        pool_size: usize,
    ) -> Self {
        Self {
            queue,
            collector,
            config,
            pool_size: pool_size.max(1),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Runs every worker until `shutdown` is cancelled and all of them stopped.
    pub async fn run<WR, PR>(&self, shutdown: CancellationToken, worker_reporter: WR, progress_reporter: PR)
    where
        WR: WorkerReporter + Clone + 'static,
        PR: ProgressReporter + Clone + 'static,
    {
        let mut workers = JoinSet::new();

        for n in 0..self.pool_size {
            let worker = WorkerService::new(
                self.queue.clone(),
                self.collector.clone(),
                self.config
                    .clone()
                    .with_worker_id(format!("{}-{}", self.config.worker_id, n)),
            );
            let shutdown = shutdown.clone();
            let worker_reporter = worker_reporter.clone();
            let progress_reporter = progress_reporter.clone();

            workers.spawn(async move {
                worker
                    .run(shutdown, &worker_reporter, &progress_reporter)
                    .await
            });
        }
        info!(pool_size = self.pool_size, "Worker pool started");

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %e, "Worker exited with error"),
                Err(e) => error!(error = %e, "Worker task panicked"),
            }
        }
        info!("Worker pool stopped");
    }
}
