//! Trait definitions for external dependencies.
//!
//! This module defines traits that abstract over external dependencies
//! (the platform API, the task store, the result store), enabling:
//!
//! - **Testability**: Mock implementations for unit testing
//! - **Flexibility**: PostgreSQL in production, [`crate::memory::MemoryBackend`] embedded
//! - **Decoupling**: The pipeline doesn't depend on specific implementations
//!
//! # Example
//!
//! ```
//! use gather_core::traits::{PlatformClient, ResultStore};
//! use uuid::Uuid;
//!
//! async fn resolve_one<C, R>(
//!     client: &C,
//!     results: &R,
//!     task_id: Uuid,
//!     group_id: &str,
//! ) -> Result<(), gather_core::AppError>
//! where
//!     C: PlatformClient,
//!     R: ResultStore,
//! {
//!     let group = client.fetch_group(group_id).await?;
//!     results.upsert_groups(task_id, &[group]).await?;
//!     Ok(())
//! }
//! ```

use std::future::Future;

use uuid::Uuid;

use crate::error::AppError;
use crate::job::Job;
use crate::models::{Comment, Group, Page, Post};
use crate::task::{NewTask, Task, TaskError, TaskMetrics, TaskStatus};

/// Client for the external platform API.
///
/// Implementations must classify failures through [`AppError`] so the
/// pipeline can tell transient, permanent and fatal errors apart.
pub trait PlatformClient: Send + Sync + Clone {
    /// Resolves a group by its platform id.
    fn fetch_group(&self, group_id: &str) -> impl Future<Output = Result<Group, AppError>> + Send;

    /// Fetches one page of a group's posts.
    ///
    /// # Arguments
    ///
    /// * `group_id` - The group identifier
    /// * `cursor` - Cursor returned by the previous page, `None` for the first
    fn fetch_posts(
        &self,
        group_id: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<Page<Post>, AppError>> + Send;

    /// Fetches one page of a post's comments.
    fn fetch_comments(
        &self,
        post_id: &str,
        cursor: Option<&str>,
    ) -> impl Future<Output = Result<Page<Comment>, AppError>> + Send;
}

/// What a batch pushes to the task store.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    /// Metrics as counted by this execution; merged field-wise with the stored ones.
    pub metrics: TaskMetrics,
    /// Errors to append.
    pub errors: Vec<TaskError>,
    /// Calculated percentage; the store keeps the maximum.
    pub percentage: u8,
}

/// Store for task state.
pub trait TaskStore: Send + Sync + Clone {
    /// Creates a task and enqueues its job as one atomic step.
    ///
    /// Either both exist afterwards or neither does.
    fn create_task(
        &self,
        new_task: NewTask,
        max_attempts: u32,
    ) -> impl Future<Output = Result<(Task, Job), AppError>> + Send;

    /// Retrieves a task by ID.
    fn get_task(&self, id: Uuid) -> impl Future<Output = Result<Option<Task>, AppError>> + Send;

    /// Moves a task to `processing`, stamping `started_at` the first time.
    ///
    /// A task that is already terminal is returned unchanged.
    fn mark_processing(&self, id: Uuid) -> impl Future<Output = Result<Task, AppError>> + Send;

    /// Persists the outcome of one batch.
    fn record_progress(
        &self,
        id: Uuid,
        update: &ProgressUpdate,
    ) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Moves a non-terminal task to a terminal `status`, stamping `finished_at`.
    ///
    /// Returns `false` when the transition is not allowed (e.g. the task
    /// already finished), leaving the task untouched.
    fn finish_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<TaskError>,
    ) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Requests cancellation.
    ///
    /// A pending task is cancelled immediately, a processing task gets its
    /// flag set for the worker to observe. Returns the resulting status.
    fn request_cancel(&self, id: Uuid) -> impl Future<Output = Result<TaskStatus, AppError>> + Send;

    /// Whether cancellation was requested for the task.
    fn is_cancel_requested(&self, id: Uuid) -> impl Future<Output = Result<bool, AppError>> + Send;
}

/// Store for collected records.
///
/// All writes are idempotent upserts keyed by `(task_id, external_id)`, so a
/// re-executed batch never creates duplicates.
pub trait ResultStore: Send + Sync + Clone {
    fn upsert_groups(
        &self,
        task_id: Uuid,
        groups: &[Group],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn upsert_posts(
        &self,
        task_id: Uuid,
        posts: &[Post],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn upsert_comments(
        &self,
        task_id: Uuid,
        comments: &[Comment],
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Groups resolved for a task, in external id order.
    fn list_groups(&self, task_id: Uuid) -> impl Future<Output = Result<Vec<Group>, AppError>> + Send;

    /// Number of stored posts and comments for a task.
    fn count_records(
        &self,
        task_id: Uuid,
    ) -> impl Future<Output = Result<RecordCounts, AppError>> + Send;
}

/// Stored record counts of a task.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    pub groups: u64,
    pub posts: u64,
    pub comments: u64,
}
