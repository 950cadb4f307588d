//! Task and result repository for PostgreSQL.
//!
//! Metrics live in plain columns so that a progress update is a single
//! `UPDATE` with `GREATEST` per counter: concurrent or replayed updates can
//! never move a counter backwards. Collected records are upserted in one
//! statement per batch with `UNNEST` arrays, keyed by `(task_id, external_id)`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgExecutor, PgPool, Pool, Postgres};
use uuid::Uuid;

use gather_core::error::AppError;
use gather_core::job::Job;
use gather_core::models::{Comment, Group, Post};
use gather_core::task::{NewTask, Task, TaskError, TaskMetrics, TaskOptions, TaskStatus};
use gather_core::traits::{ProgressUpdate, RecordCounts, ResultStore, TaskStore};

use crate::job_repository::insert_job;
use crate::store_error;

/// Repository for task state and collected records.
///
/// # Examples
///
/// ```no_run
/// use gather_core::{DbConfig, TaskOptions, TaskService};
/// use gather_db::{JobRepository, TaskRepository};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let pool = gather_db::connect("postgresql://localhost/gather", &DbConfig::default()).await?;
/// let tasks = TaskRepository::new(pool.clone());
/// let service = TaskService::new(tasks.clone(), tasks, JobRepository::new(pool));
/// let task = service.submit(["123", "456"], TaskOptions::default()).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TaskRepository {
    pool: Pool<Postgres>,
}

impl TaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Statuses as stored, for `status = ANY($n)` filters.
    fn status_strings(statuses: &[TaskStatus]) -> Vec<String> {
        statuses.iter().map(|s| s.as_str().to_string()).collect()
    }

    async fn exists(&self, id: Uuid) -> Result<bool, AppError> {
        let (exists,): (bool,) =
            sqlx::query_as("SELECT EXISTS (SELECT 1 FROM collection_tasks WHERE id = $1)")
                .bind(id)
                .fetch_one(&self.pool)
                .await
                .map_err(store_error)?;
        Ok(exists)
    }
}

// =============================================================================
// Helper Types for Database Mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct TaskRow {
    id: Uuid,
    status: String,
    group_ids: Vec<String>,
    groups_total: i64,
    groups_processed: i64,
    posts_total: i64,
    posts_processed: i64,
    comments_total: i64,
    comments_processed: i64,
    estimated_comments_per_post: f64,
    posts_total_exact: bool,
    comments_total_exact: bool,
    errors: Json<Vec<TaskError>>,
    options: Json<TaskOptions>,
    progress: i16,
    cancel_requested: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

/// Counters are never negative in the table; a corrupt row reads as 0.
fn count(value: i64) -> u64 {
    value.max(0) as u64
}

/// Counters beyond `i64::MAX` are saturated on the way in.
fn column(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl TryFrom<TaskRow> for Task {
    type Error = AppError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| AppError::Generic(format!("task {}: {}", row.id, e)))?;
        Ok(Self {
            id: row.id,
            status,
            group_ids: row.group_ids,
            metrics: TaskMetrics {
                groups_total: count(row.groups_total),
                groups_processed: count(row.groups_processed),
                posts_total: count(row.posts_total),
                posts_processed: count(row.posts_processed),
                comments_total: count(row.comments_total),
                comments_processed: count(row.comments_processed),
                estimated_comments_per_post: row.estimated_comments_per_post,
                posts_total_exact: row.posts_total_exact,
                comments_total_exact: row.comments_total_exact,
            },
            errors: row.errors.0,
            options: row.options.0,
            progress: row.progress.clamp(0, 100) as u8,
            cancel_requested: row.cancel_requested,
            created_at: row.created_at,
            updated_at: row.updated_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

async fn insert_task<'e, E>(executor: E, task: &Task) -> Result<Task, AppError>
where
    E: PgExecutor<'e>,
{
    let row: TaskRow = sqlx::query_as(
        r#"
        INSERT INTO collection_tasks (
            id, status, group_ids,
            groups_total, estimated_comments_per_post,
            options, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING *
        "#,
    )
    .bind(task.id)
    .bind(task.status.as_str())
    .bind(&task.group_ids)
    .bind(column(task.metrics.groups_total))
    .bind(task.metrics.estimated_comments_per_post)
    .bind(Json(&task.options))
    .bind(task.created_at)
    .fetch_one(executor)
    .await
    .map_err(store_error)?;

    row.try_into()
}

/// Keeps the last occurrence of every key; a single `INSERT ... ON CONFLICT`
/// may not touch the same row twice.
fn dedup_by_key<'a, T>(items: &'a [T], key: impl Fn(&T) -> &str) -> Vec<&'a T> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut out: Vec<&T> = Vec::with_capacity(items.len());
    for item in items {
        match index.get(key(item)) {
            Some(&i) => out[i] = item,
            None => {
                index.insert(key(item), out.len());
                out.push(item);
            }
        }
    }
    out
}

// =============================================================================
// TaskStore Trait Implementation
// =============================================================================

impl TaskStore for TaskRepository {
    async fn create_task(&self, new_task: NewTask, max_attempts: u32) -> Result<(Task, Job), AppError> {
        let task = Task::from_new(new_task);
        let job = Job::new(task.id, max_attempts);

        let mut tx = self.pool.begin().await.map_err(store_error)?;
        let task = insert_task(&mut *tx, &task).await?;
        let job = insert_job(&mut *tx, &job).await?;
        tx.commit().await.map_err(store_error)?;

        Ok((task, job))
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, AppError> {
        let row: Option<TaskRow> = sqlx::query_as("SELECT * FROM collection_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(store_error)?;

        row.map(Task::try_from).transpose()
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Task, AppError> {
        let row: Option<TaskRow> = sqlx::query_as(
            r#"
            UPDATE collection_tasks
            SET
                status = 'processing',
                started_at = COALESCE(started_at, NOW()),
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($2)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(Self::status_strings(&TaskStatus::sources_of(
            TaskStatus::Processing,
        )))
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        match row {
            Some(row) => row.try_into(),
            // Terminal tasks come back unchanged.
            None => self.get_task(id).await?.ok_or(AppError::TaskNotFound(id)),
        }
    }

    async fn record_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<(), AppError> {
        let m = &update.metrics;
        let estimate = m
            .estimated_comments_per_post
            .is_finite()
            .then_some(m.estimated_comments_per_post);

        let result = sqlx::query(
            r#"
            UPDATE collection_tasks
            SET
                groups_total = GREATEST(groups_total, $2),
                groups_processed = GREATEST(groups_processed, $3),
                posts_total = GREATEST(posts_total, $4),
                posts_processed = GREATEST(posts_processed, $5),
                comments_total = GREATEST(comments_total, $6),
                comments_processed = GREATEST(comments_processed, $7),
                estimated_comments_per_post = GREATEST(estimated_comments_per_post, COALESCE($8, estimated_comments_per_post)),
                posts_total_exact = posts_total_exact OR $9,
                comments_total_exact = comments_total_exact OR $10,
                progress = GREATEST(progress, $11),
                errors = errors || $12,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(column(m.groups_total))
        .bind(column(m.groups_processed))
        .bind(column(m.posts_total))
        .bind(column(m.posts_processed))
        .bind(column(m.comments_total))
        .bind(column(m.comments_processed))
        .bind(estimate)
        .bind(m.posts_total_exact)
        .bind(m.comments_total_exact)
        .bind(update.percentage.min(100) as i16)
        .bind(Json(&update.errors))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() == 0 {
            return Err(AppError::TaskNotFound(id));
        }
        Ok(())
    }

    async fn finish_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<TaskError>,
    ) -> Result<bool, AppError> {
        if !status.is_terminal() {
            return Ok(false);
        }
        let errors: Vec<TaskError> = error.into_iter().collect();

        let result = sqlx::query(
            r#"
            UPDATE collection_tasks
            SET
                status = $2,
                finished_at = COALESCE(finished_at, NOW()),
                errors = errors || $3,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($4)
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(Json(&errors))
        .bind(Self::status_strings(&TaskStatus::sources_of(status)))
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }
        if self.exists(id).await? {
            Ok(false)
        } else {
            Err(AppError::TaskNotFound(id))
        }
    }

    async fn request_cancel(&self, id: Uuid) -> Result<TaskStatus, AppError> {
        // SET expressions see the row as it was before the update.
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            UPDATE collection_tasks
            SET
                status = CASE WHEN status = 'pending' THEN 'cancelled' ELSE status END,
                cancel_requested = cancel_requested OR status IN ('pending', 'processing'),
                finished_at = CASE
                    WHEN status = 'pending' THEN COALESCE(finished_at, NOW())
                    ELSE finished_at
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING status
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(store_error)?;

        let (status,) = row.ok_or(AppError::TaskNotFound(id))?;
        status
            .parse()
            .map_err(|e| AppError::Generic(format!("task {}: {}", id, e)))
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, AppError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT cancel_requested FROM collection_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .map_err(store_error)?;

        row.map(|(flag,)| flag).ok_or(AppError::TaskNotFound(id))
    }
}

// =============================================================================
// ResultStore Trait Implementation
// =============================================================================

#[derive(sqlx::FromRow)]
struct GroupRow {
    external_id: String,
    name: String,
    member_count: Option<i64>,
    privacy: Option<String>,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Self {
            external_id: row.external_id,
            name: row.name,
            member_count: row.member_count.map(count),
            privacy: row.privacy,
        }
    }
}

impl ResultStore for TaskRepository {
    async fn upsert_groups(&self, task_id: Uuid, groups: &[Group]) -> Result<u64, AppError> {
        let groups = dedup_by_key(groups, |g| g.external_id.as_str());
        if groups.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = groups.iter().map(|g| g.external_id.as_str()).collect();
        let names: Vec<&str> = groups.iter().map(|g| g.name.as_str()).collect();
        let members: Vec<Option<i64>> = groups.iter().map(|g| g.member_count.map(column)).collect();
        let privacy: Vec<Option<&str>> = groups.iter().map(|g| g.privacy.as_deref()).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO collected_groups (task_id, external_id, name, member_count, privacy)
            SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::bigint[], $5::text[])
            ON CONFLICT (task_id, external_id)
            DO UPDATE SET
                name = EXCLUDED.name,
                member_count = EXCLUDED.member_count,
                privacy = EXCLUDED.privacy,
                collected_at = NOW()
            "#,
        )
        .bind(task_id)
        .bind(&ids)
        .bind(&names)
        .bind(&members)
        .bind(&privacy)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn upsert_posts(&self, task_id: Uuid, posts: &[Post]) -> Result<u64, AppError> {
        let posts = dedup_by_key(posts, |p| p.external_id.as_str());
        if posts.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = posts.iter().map(|p| p.external_id.as_str()).collect();
        let group_ids: Vec<&str> = posts.iter().map(|p| p.group_id.as_str()).collect();
        let authors: Vec<Option<&str>> = posts.iter().map(|p| p.author.as_deref()).collect();
        let messages: Vec<Option<&str>> = posts.iter().map(|p| p.message.as_deref()).collect();
        let created: Vec<Option<DateTime<Utc>>> = posts.iter().map(|p| p.created_time).collect();
        let comment_counts: Vec<Option<i64>> =
            posts.iter().map(|p| p.comment_count.map(column)).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO collected_posts (
                task_id, external_id, group_id, author, message, created_time, comment_count
            )
            SELECT $1, * FROM UNNEST(
                $2::text[], $3::text[], $4::text[], $5::text[], $6::timestamptz[], $7::bigint[]
            )
            ON CONFLICT (task_id, external_id)
            DO UPDATE SET
                group_id = EXCLUDED.group_id,
                author = EXCLUDED.author,
                message = EXCLUDED.message,
                created_time = EXCLUDED.created_time,
                comment_count = EXCLUDED.comment_count,
                collected_at = NOW()
            "#,
        )
        .bind(task_id)
        .bind(&ids)
        .bind(&group_ids)
        .bind(&authors)
        .bind(&messages)
        .bind(&created)
        .bind(&comment_counts)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn upsert_comments(&self, task_id: Uuid, comments: &[Comment]) -> Result<u64, AppError> {
        let comments = dedup_by_key(comments, |c| c.external_id.as_str());
        if comments.is_empty() {
            return Ok(0);
        }

        let ids: Vec<&str> = comments.iter().map(|c| c.external_id.as_str()).collect();
        let post_ids: Vec<&str> = comments.iter().map(|c| c.post_id.as_str()).collect();
        let authors: Vec<Option<&str>> = comments.iter().map(|c| c.author.as_deref()).collect();
        let messages: Vec<Option<&str>> = comments.iter().map(|c| c.message.as_deref()).collect();
        let created: Vec<Option<DateTime<Utc>>> = comments.iter().map(|c| c.created_time).collect();

        let result = sqlx::query(
            r#"
            INSERT INTO collected_comments (task_id, external_id, post_id, author, message, created_time)
            SELECT $1, * FROM UNNEST($2::text[], $3::text[], $4::text[], $5::text[], $6::timestamptz[])
            ON CONFLICT (task_id, external_id)
            DO UPDATE SET
                post_id = EXCLUDED.post_id,
                author = EXCLUDED.author,
                message = EXCLUDED.message,
                created_time = EXCLUDED.created_time,
                collected_at = NOW()
            "#,
        )
        .bind(task_id)
        .bind(&ids)
        .bind(&post_ids)
        .bind(&authors)
        .bind(&messages)
        .bind(&created)
        .execute(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(result.rows_affected())
    }

    async fn list_groups(&self, task_id: Uuid) -> Result<Vec<Group>, AppError> {
        let rows: Vec<GroupRow> = sqlx::query_as(
            r#"
            SELECT external_id, name, member_count, privacy
            FROM collected_groups
            WHERE task_id = $1
            ORDER BY external_id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn count_records(&self, task_id: Uuid) -> Result<RecordCounts, AppError> {
        let (groups, posts, comments): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM collected_groups WHERE task_id = $1),
                (SELECT COUNT(*) FROM collected_posts WHERE task_id = $1),
                (SELECT COUNT(*) FROM collected_comments WHERE task_id = $1)
            "#,
        )
        .bind(task_id)
        .fetch_one(&self.pool)
        .await
        .map_err(store_error)?;

        Ok(RecordCounts {
            groups: count(groups),
            posts: count(posts),
            comments: count(comments),
        })
    }
}
