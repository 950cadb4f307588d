//! Collection pipeline.
//!
//! [`CollectionService`] walks one task through three strictly sequential
//! phases:
//!
//! 1. **Groups**: resolve the submitted ids in batches, concurrently.
//! 2. **Posts**: page through the posts of every resolved group. One batch is
//!    one page round over up to `concurrency` groups.
//! 3. **Comments**: page through the comments of every collected post, until
//!    the inputs run out or the task's `max_comments` budget is spent.
//!
//! # Single writer
//!
//! Fetches inside a batch run concurrently but only *return* values. The
//! pipeline loop applies them to its own [`TaskMetrics`] after the batch, then
//! upserts the records, clamps totals and pushes metrics, new errors and the
//! calculated percentage to the [`TaskStore`]. No counter is shared between
//! tasks.
//!
//! # Failures
//!
//! Every platform call runs under the configured [`RetryPolicy`](crate::RetryPolicy):
//! - transient errors are retried; exhaustion is recorded as an item error
//! - permanent errors (not found, forbidden, invalid id) are recorded as an
//!   item error and the item is skipped
//! - fatal errors (invalid credentials) abort the execution with `Err`
//!
//! Store errors also abort with `Err`; they are transient, so the worker
//! hands the job back to the queue for another attempt.
//!
//! # Re-execution
//!
//! A redelivered job starts again from the first phase. Upserts are keyed by
//! `(task_id, external_id)` and stores merge metrics field-wise with `max`,
//! so nothing is counted twice. Errors already recorded on the task are not
//! appended again.
//!
//! # Cancellation
//!
//! Before every batch the pipeline checks the task's cancel flag, then the
//! worker's shutdown token. The flag ends the run as
//! [`CollectionStatus::Cancelled`], the token as
//! [`CollectionStatus::Interrupted`]. In-flight batches always finish.

use std::collections::{HashMap, HashSet};

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CollectConfig;
use crate::error::AppError;
use crate::models::{Comment, Group, Page, Post};
use crate::progress::{Phase, ProgressCalculator};
use crate::reporter::{CollectionEvent, ProgressReporter, SilentReporter};
use crate::retry::RetryFailure;
use crate::stats::{CollectionResult, CollectionStats, CollectionStatus, ItemOutcome};
use crate::task::{ErrorScope, Task, TaskError, TaskMetrics};
use crate::traits::{PlatformClient, ProgressUpdate, ResultStore, TaskStore};

/// Position of one paginated listing.
#[derive(Debug, Clone)]
struct PageCursor {
    /// Group id for posts, post id for comments.
    owner: String,
    next: Option<String>,
}

impl PageCursor {
    fn start(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            next: None,
        }
    }

    /// Cursor for the following page, `None` once the listing is exhausted.
    ///
    /// A platform that hands back the cursor it was just given would loop
    /// forever, so a repeated cursor ends the listing too.
    fn advance(self, next: Option<String>) -> Option<Self> {
        match next {
            Some(next) if self.next.as_deref() == Some(next.as_str()) => {
                warn!(owner = %self.owner, cursor = %next, "Platform repeated a cursor, stopping pagination");
                None
            }
            Some(next) => Some(Self {
                owner: self.owner,
                next: Some(next),
            }),
            None => None,
        }
    }
}

/// State of one execution, owned by the pipeline loop.
struct Execution {
    task_id: Uuid,
    metrics: TaskMetrics,
    calculator: ProgressCalculator,
    stats: CollectionStats,
    max_comments: Option<u64>,
    /// Errors already on the task or pushed by this execution.
    known_errors: HashSet<(ErrorScope, Option<String>, String)>,
    /// Errors not pushed to the store yet.
    pending_errors: Vec<TaskError>,
    /// Latest total reported per group.
    post_totals: HashMap<String, u64>,
    /// Latest comment count reported per post.
    comment_totals: HashMap<String, u64>,
    seen_posts: HashSet<String>,
    seen_comments: HashSet<String>,
}

impl Execution {
    fn new(task: &Task, config: &CollectConfig) -> Self {
        let metrics = TaskMetrics::for_groups(
            task.group_ids.len() as u64,
            task.metrics.estimated_comments_per_post,
        );
        let known_errors = task
            .errors
            .iter()
            .map(|e| (e.scope, e.external_id.clone(), e.message.clone()))
            .collect();

        Self {
            task_id: task.id,
            metrics,
            calculator: ProgressCalculator::new(config.progress.for_task(&task.options)),
            stats: CollectionStats::new(),
            max_comments: task.options.max_comments,
            known_errors,
            pending_errors: Vec::new(),
            post_totals: HashMap::new(),
            comment_totals: HashMap::new(),
            seen_posts: HashSet::new(),
            seen_comments: HashSet::new(),
        }
    }

    fn record_error<P: ProgressReporter>(&mut self, phase: Phase, error: TaskError, reporter: &P) {
        self.stats.record(phase, ItemOutcome::Failed);
        let key = (error.scope, error.external_id.clone(), error.message.clone());
        if !self.known_errors.insert(key) {
            debug!(task_id = %self.task_id, message = %error.message, "Error already recorded");
            return;
        }
        reporter.report(CollectionEvent::ItemFailed {
            task_id: self.task_id,
            error: &error,
        });
        self.pending_errors.push(error);
    }

    /// Keeps posts not seen earlier in this execution.
    fn fresh_posts(&mut self, posts: Vec<Post>) -> Vec<Post> {
        posts
            .into_iter()
            .filter(|p| self.seen_posts.insert(p.external_id.clone()))
            .collect()
    }

    fn fresh_comments(&mut self, comments: Vec<Comment>) -> Vec<Comment> {
        comments
            .into_iter()
            .filter(|c| self.seen_comments.insert(c.external_id.clone()))
            .collect()
    }

    /// Comments that may still be collected under `max_comments`.
    fn comment_budget(&self) -> Option<u64> {
        self.max_comments
            .map(|max| max.saturating_sub(self.metrics.comments_processed))
    }

    fn refresh_totals(&mut self) {
        let posts_total: u64 = self.post_totals.values().sum();
        let mut comments_total: u64 = self.comment_totals.values().sum();
        if let Some(max) = self.max_comments {
            comments_total = comments_total.min(max);
        }
        self.metrics.posts_total = self.metrics.posts_total.max(posts_total);
        self.metrics.comments_total = self.metrics.comments_total.max(comments_total);
    }
}

/// Service running the collection pipeline for a task.
///
/// # Type Parameters
///
/// * `S` - Task store (metrics, errors, cancel flag)
/// * `R` - Result store (collected records)
/// * `C` - Platform client, usually wrapped in a [`RateLimitedClient`](crate::RateLimitedClient)
pub struct CollectionService<S, R, C>
where
    S: TaskStore,
    R: ResultStore,
    C: PlatformClient,
{
    tasks: S,
    results: R,
    client: C,
    config: CollectConfig,
}

impl<S, R, C> Clone for CollectionService<S, R, C>
where
    S: TaskStore,
    R: ResultStore,
    C: PlatformClient,
{
    fn clone(&self) -> Self {
        Self {
            tasks: self.tasks.clone(),
            results: self.results.clone(),
            client: self.client.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, R, C> CollectionService<S, R, C>
where
    S: TaskStore,
    R: ResultStore,
    C: PlatformClient,
{
    /// Creates a collection service with default configuration.
    pub fn new(tasks: S, results: R, client: C) -> Self {
        Self::with_config(tasks, results, client, CollectConfig::default())
    }

    /// Creates a collection service with custom configuration.
    pub fn with_config(tasks: S, results: R, client: C, config: CollectConfig) -> Self {
        Self {
            tasks,
            results,
            client,
            config,
        }
    }

    pub fn config(&self) -> &CollectConfig {
        &self.config
    }

    pub fn task_store(&self) -> &S {
        &self.tasks
    }

    /// Collects a task without cancellation or reporting.
    pub async fn collect_task(&self, task: &Task) -> Result<CollectionResult, AppError> {
        self.collect(task, &CancellationToken::new(), &SilentReporter)
            .await
    }

    /// Runs every phase for `task`.
    ///
    /// # Errors
    ///
    /// Returns a fatal platform error (the task must be failed) or a store
    /// error (the job should be retried).
    pub async fn collect<P: ProgressReporter>(
        &self,
        task: &Task,
        shutdown: &CancellationToken,
        reporter: &P,
    ) -> Result<CollectionResult, AppError> {
        let mut exec = Execution::new(task, &self.config);
        reporter.report(CollectionEvent::Started {
            task_id: task.id,
            groups: task.group_ids.len(),
        });

        let resolved = match self
            .collect_groups(task, &mut exec, shutdown, reporter)
            .await?
        {
            Ok(resolved) => resolved,
            Err(stop) => return Ok(self.stopped(exec, stop, reporter)),
        };

        let post_ids = match self
            .collect_posts(&resolved, &mut exec, shutdown, reporter)
            .await?
        {
            Ok(post_ids) => post_ids,
            Err(stop) => return Ok(self.stopped(exec, stop, reporter)),
        };

        if let Err(stop) = self
            .collect_comments(&post_ids, &mut exec, shutdown, reporter)
            .await?
        {
            return Ok(self.stopped(exec, stop, reporter));
        }

        reporter.report(CollectionEvent::Completed {
            task_id: task.id,
            stats: &exec.stats,
        });
        Ok(CollectionResult::completed(exec.stats))
    }

    // =========================================================================
    // Phases
    // =========================================================================

    /// Resolves groups. Returns the ids of the resolved groups in submission order.
    async fn collect_groups<P: ProgressReporter>(
        &self,
        task: &Task,
        exec: &mut Execution,
        shutdown: &CancellationToken,
        reporter: &P,
    ) -> Result<Result<Vec<String>, CollectionStatus>, AppError> {
        reporter.report(CollectionEvent::PhaseStarted {
            task_id: exec.task_id,
            phase: Phase::Groups,
        });
        let mut resolved = Vec::with_capacity(task.group_ids.len());

        for batch in task.group_ids.chunks(self.config.group_batch_size) {
            if let Some(stop) = self.should_stop(exec.task_id, shutdown).await? {
                return Ok(Err(stop));
            }

            let fetched: Vec<(String, Result<Group, RetryFailure>)> = stream::iter(batch.iter().cloned())
                .map(|group_id| async move {
                    let result = self
                        .config
                        .retry
                        .run("fetch_group", || self.client.fetch_group(&group_id))
                        .await;
                    (group_id, result)
                })
                .buffered(self.config.concurrency)
                .collect()
                .await;

            let mut groups = Vec::with_capacity(fetched.len());
            for (group_id, result) in fetched {
                match result {
                    Ok(group) => {
                        resolved.push(group_id);
                        groups.push(group);
                    }
                    Err(failure) if failure.error.is_fatal() => return Err(failure.error),
                    Err(failure) => exec.record_error(
                        Phase::Groups,
                        TaskError::new(ErrorScope::Group, group_id, failure.describe()),
                        reporter,
                    ),
                }
            }

            let count = groups.len();
            if count > 0 {
                self.results.upsert_groups(exec.task_id, &groups).await?;
            }
            exec.stats
                .record_many(Phase::Groups, ItemOutcome::Collected, count);
            exec.metrics.groups_processed += count as u64;
            self.push(exec, Phase::Groups, reporter).await?;
        }

        reporter.report(CollectionEvent::PhaseCompleted {
            task_id: exec.task_id,
            phase: Phase::Groups,
        });
        Ok(Ok(resolved))
    }

    /// Pages through posts of every resolved group. Returns the collected post ids.
    async fn collect_posts<P: ProgressReporter>(
        &self,
        group_ids: &[String],
        exec: &mut Execution,
        shutdown: &CancellationToken,
        reporter: &P,
    ) -> Result<Result<Vec<String>, CollectionStatus>, AppError> {
        reporter.report(CollectionEvent::PhaseStarted {
            task_id: exec.task_id,
            phase: Phase::Posts,
        });
        let mut post_ids = Vec::new();

        for chunk in group_ids.chunks(self.config.concurrency) {
            let mut cursors: Vec<PageCursor> = chunk.iter().map(PageCursor::start).collect();

            while !cursors.is_empty() {
                if let Some(stop) = self.should_stop(exec.task_id, shutdown).await? {
                    return Ok(Err(stop));
                }

                let fetched = self.fetch_post_round(cursors).await;
                let mut next_round = Vec::with_capacity(fetched.len());
                let mut posts = Vec::new();

                for (cursor, result) in fetched {
                    match result {
                        Ok(page) => {
                            if let Some(total) = page.total {
                                exec.post_totals.insert(cursor.owner.clone(), total);
                            }
                            for post in &page.items {
                                if let Some(count) = post.comment_count {
                                    exec.comment_totals.insert(post.external_id.clone(), count);
                                }
                            }
                            posts.extend(exec.fresh_posts(page.items));
                            next_round.extend(cursor.advance(page.next_cursor));
                        }
                        Err(failure) if failure.error.is_fatal() => return Err(failure.error),
                        Err(failure) => exec.record_error(
                            Phase::Posts,
                            TaskError::new(
                                ErrorScope::Group,
                                cursor.owner,
                                format!("posts: {}", failure.describe()),
                            ),
                            reporter,
                        ),
                    }
                }

                let count = posts.len();
                if count > 0 {
                    self.results.upsert_posts(exec.task_id, &posts).await?;
                }
                post_ids.extend(posts.into_iter().map(|p| p.external_id));
                exec.stats
                    .record_many(Phase::Posts, ItemOutcome::Collected, count);
                exec.metrics.posts_processed += count as u64;
                exec.refresh_totals();
                self.push(exec, Phase::Posts, reporter).await?;

                cursors = next_round;
            }
        }

        exec.metrics.posts_total_exact = true;
        self.push(exec, Phase::Posts, reporter).await?;
        reporter.report(CollectionEvent::PhaseCompleted {
            task_id: exec.task_id,
            phase: Phase::Posts,
        });
        Ok(Ok(post_ids))
    }

    /// Pages through comments of every collected post, within the task's budget.
    async fn collect_comments<P: ProgressReporter>(
        &self,
        post_ids: &[String],
        exec: &mut Execution,
        shutdown: &CancellationToken,
        reporter: &P,
    ) -> Result<Result<(), CollectionStatus>, AppError> {
        reporter.report(CollectionEvent::PhaseStarted {
            task_id: exec.task_id,
            phase: Phase::Comments,
        });

        'posts: for chunk in post_ids.chunks(self.config.concurrency) {
            let mut cursors: Vec<PageCursor> = chunk.iter().map(PageCursor::start).collect();

            while !cursors.is_empty() {
                if exec.comment_budget() == Some(0) {
                    debug!(task_id = %exec.task_id, "Comment budget spent");
                    break 'posts;
                }
                if let Some(stop) = self.should_stop(exec.task_id, shutdown).await? {
                    return Ok(Err(stop));
                }

                let fetched = self.fetch_comment_round(cursors).await;
                let mut next_round = Vec::with_capacity(fetched.len());
                let mut comments = Vec::new();

                for (cursor, result) in fetched {
                    match result {
                        Ok(page) => {
                            if let Some(total) = page.total {
                                exec.comment_totals.insert(cursor.owner.clone(), total);
                            }
                            comments.extend(exec.fresh_comments(page.items));
                            next_round.extend(cursor.advance(page.next_cursor));
                        }
                        Err(failure) if failure.error.is_fatal() => return Err(failure.error),
                        Err(failure) => exec.record_error(
                            Phase::Comments,
                            TaskError::new(
                                ErrorScope::Post,
                                cursor.owner,
                                format!("comments: {}", failure.describe()),
                            ),
                            reporter,
                        ),
                    }
                }

                if let Some(budget) = exec.comment_budget() {
                    let budget = usize::try_from(budget).unwrap_or(usize::MAX);
                    comments.truncate(budget);
                }

                let count = comments.len();
                if count > 0 {
                    self.results.upsert_comments(exec.task_id, &comments).await?;
                }
                exec.stats
                    .record_many(Phase::Comments, ItemOutcome::Collected, count);
                exec.metrics.comments_processed += count as u64;
                exec.refresh_totals();
                self.push(exec, Phase::Comments, reporter).await?;

                cursors = next_round;
            }
        }

        exec.metrics.comments_total_exact = true;
        self.push(exec, Phase::Comments, reporter).await?;
        reporter.report(CollectionEvent::PhaseCompleted {
            task_id: exec.task_id,
            phase: Phase::Comments,
        });
        Ok(Ok(()))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn fetch_post_round(
        &self,
        cursors: Vec<PageCursor>,
    ) -> Vec<(PageCursor, Result<Page<Post>, RetryFailure>)> {
        stream::iter(cursors)
            .map(|cursor| async move {
                let result = self
                    .config
                    .retry
                    .run("fetch_posts", || {
                        self.client.fetch_posts(&cursor.owner, cursor.next.as_deref())
                    })
                    .await;
                (cursor, result)
            })
            .buffered(self.config.concurrency)
            .collect()
            .await
    }

    async fn fetch_comment_round(
        &self,
        cursors: Vec<PageCursor>,
    ) -> Vec<(PageCursor, Result<Page<Comment>, RetryFailure>)> {
        stream::iter(cursors)
            .map(|cursor| async move {
                let result = self
                    .config
                    .retry
                    .run("fetch_comments", || {
                        self.client
                            .fetch_comments(&cursor.owner, cursor.next.as_deref())
                    })
                    .await;
                (cursor, result)
            })
            .buffered(self.config.concurrency)
            .collect()
            .await
    }

    /// Cancel flag first: a cancelled task must not be redelivered.
    async fn should_stop(
        &self,
        task_id: Uuid,
        shutdown: &CancellationToken,
    ) -> Result<Option<CollectionStatus>, AppError> {
        if self.tasks.is_cancel_requested(task_id).await? {
            return Ok(Some(CollectionStatus::Cancelled));
        }
        if shutdown.is_cancelled() {
            return Ok(Some(CollectionStatus::Interrupted));
        }
        Ok(None)
    }

    /// Persists the state after a batch.
    async fn push<P: ProgressReporter>(
        &self,
        exec: &mut Execution,
        phase: Phase,
        reporter: &P,
    ) -> Result<(), AppError> {
        exec.metrics.clamp();
        let snapshot = exec.calculator.calculate(&exec.metrics);
        let update = ProgressUpdate {
            metrics: exec.metrics.clone(),
            errors: std::mem::take(&mut exec.pending_errors),
            percentage: snapshot.percentage,
        };

        if let Err(e) = self.tasks.record_progress(exec.task_id, &update).await {
            // Keep the errors for the next push; the job retry re-runs the batch anyway.
            exec.pending_errors = update.errors;
            return Err(e);
        }

        reporter.report(CollectionEvent::BatchPersisted {
            task_id: exec.task_id,
            phase,
            snapshot: &snapshot,
        });
        Ok(())
    }

    fn stopped<P: ProgressReporter>(
        &self,
        exec: Execution,
        stop: CollectionStatus,
        reporter: &P,
    ) -> CollectionResult {
        match stop {
            CollectionStatus::Cancelled => {
                reporter.report(CollectionEvent::Cancelled {
                    task_id: exec.task_id,
                    stats: &exec.stats,
                });
                CollectionResult::cancelled(exec.stats)
            }
            CollectionStatus::Interrupted => {
                debug!(task_id = %exec.task_id, "Collection interrupted by shutdown");
                CollectionResult::interrupted(exec.stats)
            }
            CollectionStatus::Completed => CollectionResult::completed(exec.stats),
        }
    }
}
