//! Job queue trait for abstracting job persistence.
//!
//! This module provides the [`JobQueue`] trait that abstracts job queue operations,
//! enabling different storage backends (PostgreSQL, in-memory) and
//! facilitating dependency injection in the worker service.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobState};

/// Result of [`JobQueue::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job went back to `waiting` and will be redelivered.
    Retrying { next_eligible_at: DateTime<Utc> },
    /// The job is dead-lettered. Its task must be marked failed.
    Dead,
    /// The caller no longer holds the job; nothing was changed.
    NotHeld,
}

/// Result of [`JobQueue::reap_expired`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReapOutcome {
    /// Expired jobs put back to `waiting`.
    pub redelivered: u64,
    /// Expired jobs that ran out of attempts.
    pub dead: Vec<Job>,
}

/// Trait for job queue persistence operations.
///
/// # Implementation Notes
///
/// Implementations should ensure:
/// - Atomic claiming (`SELECT FOR UPDATE SKIP LOCKED` or an equivalent lock),
///   so a job is never active for two workers at once
/// - Delivery order: `priority DESC, next_eligible_at, created_at`
/// - Every delivery increments `attempt`
pub trait JobQueue: Send + Sync + Clone {
    /// Enqueue a new waiting job for `task_id`.
    fn enqueue(
        &self,
        task_id: Uuid,
        max_attempts: u32,
    ) -> impl Future<Output = Result<Job, AppError>> + Send;

    /// Claim the next eligible waiting job for `worker_id`.
    ///
    /// Returns `None` if no jobs are available.
    fn dequeue(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Mark a job active for `worker_id` as completed.
    ///
    /// Returns `false`, changing nothing, when `worker_id` no longer holds
    /// the job.
    fn ack(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Record a failed attempt of a job active for `worker_id`.
    ///
    /// Retryable failures with attempts left go back to `waiting` after a
    /// backoff; everything else is dead-lettered. A job the worker no longer
    /// holds is left alone ([`FailOutcome::NotHeld`]).
    fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        retryable: bool,
        error: &str,
    ) -> impl Future<Output = Result<FailOutcome, AppError>> + Send;

    /// Give a job active for `worker_id` back without counting the attempt.
    ///
    /// Used when a worker needs to give up a job (e.g., during shutdown).
    /// Returns `false` when the worker no longer holds it.
    fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Push the visibility deadline of an active job forward.
    ///
    /// Returns `false` when `worker_id` no longer holds the job.
    fn extend_visibility(
        &self,
        job_id: Uuid,
        worker_id: &str,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Reclaim active jobs whose visibility deadline is before `now`.
    ///
    /// Backoff of redelivered jobs starts from the current clock, not from
    /// `now`.
    fn reap_expired(
        &self,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<ReapOutcome, AppError>> + Send;

    /// Dead jobs that are the latest job of a task still `pending` or
    /// `processing`, oldest first.
    ///
    /// These tasks lost their terminal write and must still be failed.
    fn list_unsettled_dead(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    /// Move the waiting job of `task_id` to the front of the queue.
    ///
    /// Returns `None` when the task has no waiting job.
    fn prioritize(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Get a job by ID.
    fn get_job(&self, job_id: Uuid)
    -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// Most recent job of a task.
    fn find_by_task(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    /// List jobs in `state`, oldest first.
    fn list_by_state(
        &self,
        state: JobState,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    /// Get count of jobs in a state.
    fn count_by_state(&self, state: JobState)
    -> impl Future<Output = Result<u64, AppError>> + Send;
}
