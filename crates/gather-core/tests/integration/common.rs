//! Test utilities and mock implementations for integration tests.
//!
//! Provides a scripted platform client plus result and task stores that fail
//! on demand, all usable with the embedded `MemoryBackend`.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use chrono::TimeDelta;
use gather_core::traits::{PlatformClient, ProgressUpdate, RecordCounts, ResultStore, TaskStore};
use gather_core::{
    AppError, BackoffConfig, CollectConfig, CollectionService, Comment, Group, Job,
    MemoryBackend, NewTask, Page, Post, QueueConfig, RetryPolicy, Task, TaskError, TaskOptions,
    TaskService, TaskStatus,
};
use uuid::Uuid;

// =============================================================================
// ScriptedClient
// =============================================================================

/// A scripted failure for one call key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// `503` for the next `n` calls, then success.
    Transient(u32),
    /// `404` forever.
    NotFound,
    /// Invalid credentials.
    Unauthorized,
}

impl Failure {
    fn to_error(self, key: &str) -> AppError {
        match self {
            Failure::Transient(_) => AppError::ServerError(503),
            Failure::NotFound => AppError::NotFound(key.to_string()),
            Failure::Unauthorized => AppError::Unauthorized("token expired".to_string()),
        }
    }
}

#[derive(Default)]
struct Script {
    groups: HashMap<String, Group>,
    posts: HashMap<String, Vec<Post>>,
    comments: HashMap<String, Vec<Comment>>,
    failures: HashMap<String, Failure>,
    calls: HashMap<String, u32>,
}

/// Platform client serving a fixed hierarchy.
///
/// Call keys are `group:{id}`, `posts:{group_id}` and `comments:{post_id}`.
/// Pages are cut at `page_size` items; the cursor is the next offset.
#[derive(Clone)]
pub struct ScriptedClient {
    script: Arc<Mutex<Script>>,
    page_size: usize,
    report_totals: bool,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self {
            script: Arc::new(Mutex::new(Script::default())),
            page_size: 2,
            report_totals: true,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Pages carry no totals; the calculator has to estimate.
    pub fn without_totals(mut self) -> Self {
        self.report_totals = false;
        self
    }

    /// Adds group `id` with `posts` posts of `comments_per_post` comments each.
    ///
    /// Post ids are `{id}-p{n}`, comment ids `{post_id}-c{n}`.
    pub fn with_group(self, id: &str, posts: usize, comments_per_post: usize) -> Self {
        {
            let mut script = self.script.lock().unwrap();
            script.groups.insert(
                id.to_string(),
                Group {
                    external_id: id.to_string(),
                    name: format!("Group {}", id),
                    member_count: Some(42),
                    privacy: Some("OPEN".to_string()),
                },
            );
            let group_posts: Vec<Post> = (0..posts)
                .map(|n| Post {
                    external_id: format!("{}-p{}", id, n),
                    group_id: id.to_string(),
                    author: Some("author".to_string()),
                    message: Some(format!("post {}", n)),
                    created_time: None,
                    comment_count: Some(comments_per_post as u64),
                })
                .collect();
            for post in &group_posts {
                let comments = (0..comments_per_post)
                    .map(|n| Comment {
                        external_id: format!("{}-c{}", post.external_id, n),
                        post_id: post.external_id.clone(),
                        author: None,
                        message: Some(format!("comment {}", n)),
                        created_time: None,
                    })
                    .collect();
                script.comments.insert(post.external_id.clone(), comments);
            }
            script.posts.insert(id.to_string(), group_posts);
        }
        self
    }

    pub fn with_failure(self, key: &str, failure: Failure) -> Self {
        self.script
            .lock()
            .unwrap()
            .failures
            .insert(key.to_string(), failure);
        self
    }

    /// Number of calls made for `key`.
    pub fn calls(&self, key: &str) -> u32 {
        self.script
            .lock()
            .unwrap()
            .calls
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    fn enter(&self, key: &str) -> Result<(), AppError> {
        let mut script = self.script.lock().unwrap();
        *script.calls.entry(key.to_string()).or_default() += 1;

        match script.failures.get_mut(key) {
            Some(Failure::Transient(0)) | None => Ok(()),
            Some(Failure::Transient(remaining)) => {
                *remaining -= 1;
                Err(AppError::ServerError(503))
            }
            Some(failure) => Err(failure.to_error(key)),
        }
    }

    fn page<T: Clone>(&self, items: &[T], cursor: Option<&str>) -> Result<Page<T>, AppError> {
        let offset = match cursor {
            Some(cursor) => cursor
                .parse::<usize>()
                .map_err(|_| AppError::InvalidInput(format!("bad cursor {}", cursor)))?,
            None => 0,
        };
        let end = (offset + self.page_size).min(items.len());
        let mut page = Page::last(items.get(offset..end).unwrap_or_default().to_vec());
        if end < items.len() {
            page = page.with_next_cursor(end.to_string());
        }
        if self.report_totals {
            page = page.with_total(items.len() as u64);
        }
        Ok(page)
    }
}

impl PlatformClient for ScriptedClient {
    async fn fetch_group(&self, group_id: &str) -> Result<Group, AppError> {
        self.enter(&format!("group:{}", group_id))?;
        self.script
            .lock()
            .unwrap()
            .groups
            .get(group_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("group {}", group_id)))
    }

    async fn fetch_posts(&self, group_id: &str, cursor: Option<&str>) -> Result<Page<Post>, AppError> {
        self.enter(&format!("posts:{}", group_id))?;
        let posts = self
            .script
            .lock()
            .unwrap()
            .posts
            .get(group_id)
            .cloned()
            .unwrap_or_default();
        self.page(&posts, cursor)
    }

    async fn fetch_comments(
        &self,
        post_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Comment>, AppError> {
        self.enter(&format!("comments:{}", post_id))?;
        let comments = self
            .script
            .lock()
            .unwrap()
            .comments
            .get(post_id)
            .cloned()
            .unwrap_or_default();
        self.page(&comments, cursor)
    }
}

// =============================================================================
// FlakyResultStore
// =============================================================================

/// Result store whose post upserts fail with `StoreUnavailable` a number of times.
#[derive(Clone)]
pub struct FlakyResultStore {
    inner: MemoryBackend,
    failures_left: Arc<AtomicU32>,
}

impl FlakyResultStore {
    pub fn new(inner: MemoryBackend, failures: u32) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicU32::new(failures)),
        }
    }

    fn check(&self) -> Result<(), AppError> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        match consumed {
            Ok(_) => Err(AppError::StoreUnavailable("results offline".to_string())),
            Err(_) => Ok(()),
        }
    }
}

impl ResultStore for FlakyResultStore {
    async fn upsert_groups(&self, task_id: Uuid, groups: &[Group]) -> Result<u64, AppError> {
        self.inner.upsert_groups(task_id, groups).await
    }

    async fn upsert_posts(&self, task_id: Uuid, posts: &[Post]) -> Result<u64, AppError> {
        self.check()?;
        self.inner.upsert_posts(task_id, posts).await
    }

    async fn upsert_comments(&self, task_id: Uuid, comments: &[Comment]) -> Result<u64, AppError> {
        self.inner.upsert_comments(task_id, comments).await
    }

    async fn list_groups(&self, task_id: Uuid) -> Result<Vec<Group>, AppError> {
        self.inner.list_groups(task_id).await
    }

    async fn count_records(&self, task_id: Uuid) -> Result<RecordCounts, AppError> {
        self.inner.count_records(task_id).await
    }
}

// =============================================================================
// FlakyTaskStore
// =============================================================================

/// Task store whose terminal writes fail with `StoreUnavailable` a number of times.
#[derive(Clone)]
pub struct FlakyTaskStore {
    inner: MemoryBackend,
    failures_left: Arc<AtomicU32>,
}

impl FlakyTaskStore {
    pub fn new(inner: MemoryBackend, failures: u32) -> Self {
        Self {
            inner,
            failures_left: Arc::new(AtomicU32::new(failures)),
        }
    }

    pub fn failures_left(&self) -> u32 {
        self.failures_left.load(Ordering::SeqCst)
    }
}

impl TaskStore for FlakyTaskStore {
    async fn create_task(&self, new_task: NewTask, max_attempts: u32) -> Result<(Task, Job), AppError> {
        self.inner.create_task(new_task, max_attempts).await
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, AppError> {
        self.inner.get_task(id).await
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Task, AppError> {
        self.inner.mark_processing(id).await
    }

    async fn record_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<(), AppError> {
        self.inner.record_progress(id, update).await
    }

    async fn finish_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<TaskError>,
    ) -> Result<bool, AppError> {
        let consumed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if consumed.is_ok() {
            return Err(AppError::StoreUnavailable("tasks offline".to_string()));
        }
        self.inner.finish_task(id, status, error).await
    }

    async fn request_cancel(&self, id: Uuid) -> Result<TaskStatus, AppError> {
        self.inner.request_cancel(id).await
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, AppError> {
        self.inner.is_cancel_requested(id).await
    }
}

// =============================================================================
// Fixtures
// =============================================================================

/// Backend whose failed jobs are redelivered immediately.
pub fn backend() -> MemoryBackend {
    MemoryBackend::new(QueueConfig::default().with_backoff(BackoffConfig::immediate()))
}

/// Backend with a short visibility timeout, for reaping tests.
pub fn backend_with_visibility(timeout: TimeDelta, max_attempts: u32) -> MemoryBackend {
    MemoryBackend::new(
        QueueConfig::default()
            .with_backoff(BackoffConfig::immediate())
            .with_visibility_timeout(timeout)
            .with_max_attempts(max_attempts),
    )
}

/// Pipeline config without retry delays.
pub fn fast_config() -> CollectConfig {
    CollectConfig::default()
        .with_retry(RetryPolicy::immediate(3))
        .with_group_batch_size(2)
        .with_concurrency(2)
}

pub fn collector<C: PlatformClient>(
    backend: &MemoryBackend,
    client: C,
) -> CollectionService<MemoryBackend, MemoryBackend, C> {
    CollectionService::with_config(backend.clone(), backend.clone(), client, fast_config())
}

pub fn task_service(
    backend: &MemoryBackend,
) -> TaskService<MemoryBackend, MemoryBackend, MemoryBackend> {
    TaskService::new(backend.clone(), backend.clone(), backend.clone())
}

/// Submits a task and returns its id.
pub async fn submit(backend: &MemoryBackend, group_ids: &[&str], options: TaskOptions) -> Uuid {
    task_service(backend)
        .submit(group_ids.iter().copied(), options)
        .await
        .expect("submit")
        .id
}
