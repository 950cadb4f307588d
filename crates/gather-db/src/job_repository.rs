//! Job repository for PostgreSQL with SELECT FOR UPDATE SKIP LOCKED.
//!
//! Implements the [`JobQueue`] trait for persistent job storage with safe
//! concurrent job claiming using PostgreSQL's row-level locking. Failure
//! transitions are decided by [`Job::transition_after_failure`], the same
//! rule the in-memory backend applies, inside a transaction holding the row.

use chrono::{DateTime, TimeDelta, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Pool, Postgres};
use tracing::debug;
use uuid::Uuid;

use gather_core::error::AppError;
use gather_core::job::{Job, JobPayload, JobState, JobTransition, QueueConfig};
use gather_core::job_queue::{FailOutcome, JobQueue, ReapOutcome};

use crate::store_error;

/// PostgreSQL implementation of the job queue.
///
/// Uses `SELECT FOR UPDATE SKIP LOCKED` for safe concurrent job claiming,
/// ensuring that multiple workers can process jobs without conflicts.
#[derive(Clone)]
pub struct JobRepository {
    pool: Pool<Postgres>,
    config: QueueConfig,
}

impl JobRepository {
    /// Create a new job repository with the default queue configuration.
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, QueueConfig::default())
    }

    pub fn with_config(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.config
    }
}

/// Seconds of a `TimeDelta`, for `make_interval(secs => ...)`.
fn interval_secs(delta: TimeDelta) -> f64 {
    delta.num_milliseconds() as f64 / 1000.0
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

/// Helper struct for deserializing job rows from the database.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    task_id: Uuid,
    payload: Json<JobPayload>,
    state: String,
    attempt: i32,
    max_attempts: i32,
    priority: i16,
    next_eligible_at: DateTime<Utc>,
    visibility_deadline: Option<DateTime<Utc>>,
    worker_id: Option<String>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for Job {
    type Error = AppError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let state = row
            .state
            .parse::<JobState>()
            .map_err(|e| AppError::Generic(format!("job {}: {}", row.id, e)))?;
        Ok(Self {
            id: row.id,
            task_id: row.task_id,
            payload: row.payload.0,
            state,
            attempt: row.attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            priority: row.priority,
            next_eligible_at: row.next_eligible_at,
            visibility_deadline: row.visibility_deadline,
            worker_id: row.worker_id,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<Job>, AppError> {
    rows.into_iter().map(Job::try_from).collect()
}

/// Inserts a freshly built job. `created_at` and `next_eligible_at` come
/// from the database clock, which `dequeue` compares against.
pub(crate) async fn insert_job<'e, E>(executor: E, job: &Job) -> Result<Job, AppError>
where
    E: PgExecutor<'e>,
{
    let row: JobRow = sqlx::query_as(
        r#"
        INSERT INTO collection_jobs (id, task_id, payload, state, attempt, max_attempts, priority)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(job.id)
    .bind(job.task_id)
    .bind(Json(&job.payload))
    .bind(job.state.as_str())
    .bind(job.attempt as i32)
    .bind(job.max_attempts as i32)
    .bind(job.priority)
    .fetch_one(executor)
    .await
    .map_err(store_error)?;

    row.try_into()
}

/// Writes a failure transition decided in Rust.
async fn apply_transition<'e, E>(
    executor: E,
    job_id: Uuid,
    transition: JobTransition,
    error: &str,
) -> Result<(), AppError>
where
    E: PgExecutor<'e>,
{
    let (state, next_eligible_at) = match transition {
        JobTransition::Retry { next_eligible_at } => (JobState::Waiting, Some(next_eligible_at)),
        JobTransition::Dead => (JobState::Dead, None),
    };

    sqlx::query(
        r#"
        UPDATE collection_jobs
        SET
            state = $2,
            next_eligible_at = COALESCE($3, next_eligible_at),
            last_error = $4,
            worker_id = NULL,
            visibility_deadline = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .bind(state.as_str())
    .bind(next_eligible_at)
    .bind(error)
    .execute(executor)
    .await
    .map_err(store_error)?;

    Ok(())
}

// =============================================================================
// JobQueue Trait Implementation
// =============================================================================

impl JobQueue for JobRepository {
    async fn enqueue(&self, task_id: Uuid, max_attempts: u32) -> Result<Job, AppError> {
        let job = Job::new(task_id, max_attempts);
        insert_job(&self.pool, &job).await.map_err(|e| match e {
            AppError::DatabaseError(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                AppError::TaskNotFound(task_id)
            }
            other => other,
        })
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, AppError> {
        // Order: explicit priority first, then eligibility, then FIFO.
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE collection_jobs
            SET
                state = 'active',
                attempt = attempt + 1,
                payload = jsonb_set(payload, '{attempt}', to_jsonb(attempt + 1)),
                worker_id = $1,
                visibility_deadline = NOW() + make_interval(secs => $2),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM collection_jobs
                WHERE state = 'waiting'
                  AND next_eligible_at <= NOW()
                ORDER BY
                    priority DESC,
                    next_eligible_at ASC,
                    created_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(worker_id)
        .bind(interval_secs(self.config.visibility_timeout))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE collection_jobs
            SET
                state = 'completed',
                worker_id = NULL,
                visibility_deadline = NULL,
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        match self.get_job(job_id).await? {
            Some(_) => Ok(false),
            None => Err(AppError::JobNotFound(job_id)),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        retryable: bool,
        error: &str,
    ) -> Result<FailOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let row: Option<JobRow> =
            sqlx::query_as("SELECT * FROM collection_jobs WHERE id = $1 FOR UPDATE")
                .bind(job_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(store_error)?;
        let job = Job::try_from(row.ok_or(AppError::JobNotFound(job_id))?)?;
        if !job.is_held_by(worker_id) {
            return Ok(FailOutcome::NotHeld);
        }

        let transition = job.transition_after_failure(retryable, &self.config.backoff, Utc::now());
        apply_transition(&mut *tx, job_id, transition, error).await?;
        tx.commit().await.map_err(store_error)?;

        Ok(match transition {
            JobTransition::Retry { next_eligible_at } => FailOutcome::Retrying { next_eligible_at },
            JobTransition::Dead => FailOutcome::Dead,
        })
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE collection_jobs
            SET
                state = 'waiting',
                attempt = GREATEST(attempt - 1, 0),
                payload = jsonb_set(payload, '{attempt}', to_jsonb(GREATEST(attempt - 1, 0))),
                worker_id = NULL,
                visibility_deadline = NULL,
                next_eligible_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn extend_visibility(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query(
            r#"
            UPDATE collection_jobs
            SET
                visibility_deadline = NOW() + make_interval(secs => $3),
                updated_at = NOW()
            WHERE id = $1 AND state = 'active' AND worker_id = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(interval_secs(self.config.visibility_timeout))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected() > 0)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapOutcome, AppError> {
        let mut tx = self.pool.begin().await.map_err(store_error)?;

        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM collection_jobs
            WHERE state = 'active' AND visibility_deadline <= $1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_all(&mut *tx)
        .await
        .map_err(store_error)?;

        let mut outcome = ReapOutcome::default();
        let clock = Utc::now();
        for mut job in into_jobs(rows)? {
            let transition = job.transition_after_failure(true, &self.config.backoff, clock);
            apply_transition(&mut *tx, job.id, transition, "visibility timeout expired").await?;
            job.apply(transition, "visibility timeout expired", clock);
            match transition {
                JobTransition::Retry { .. } => outcome.redelivered += 1,
                JobTransition::Dead => outcome.dead.push(job),
            }
        }

        tx.commit().await.map_err(store_error)?;
        if outcome.redelivered > 0 || !outcome.dead.is_empty() {
            debug!(
                redelivered = outcome.redelivered,
                dead = outcome.dead.len(),
                "Reclaimed expired jobs"
            );
        }
        Ok(outcome)
    }

    async fn list_unsettled_dead(&self, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT j.* FROM collection_jobs j
            JOIN collection_tasks t ON t.id = j.task_id
            WHERE j.state = 'dead'
              AND t.status IN ('pending', 'processing')
              AND NOT EXISTS (
                  SELECT 1 FROM collection_jobs newer
                  WHERE newer.task_id = j.task_id AND newer.created_at > j.created_at
              )
            ORDER BY j.updated_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        into_jobs(rows)
    }

    async fn prioritize(&self, task_id: Uuid) -> Result<Option<Job>, AppError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            UPDATE collection_jobs
            SET
                priority = GREATEST(priority, 1),
                next_eligible_at = LEAST(next_eligible_at, NOW()),
                updated_at = NOW()
            WHERE id = (
                SELECT id FROM collection_jobs
                WHERE task_id = $1 AND state = 'waiting'
                ORDER BY created_at DESC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING *
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        let row: Option<JobRow> = sqlx::query_as("SELECT * FROM collection_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<Job>, AppError> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM collection_jobs
            WHERE task_id = $1
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        row.map(Job::try_from).transpose()
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, AppError> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT * FROM collection_jobs
            WHERE state = $1
            ORDER BY created_at ASC
            LIMIT $2
            "#,
        )
        .bind(state.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        into_jobs(rows)
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM collection_jobs WHERE state = $1")
                .bind(state.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?;

        Ok(count.max(0) as u64)
    }
}
