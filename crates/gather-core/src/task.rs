//! Collection task domain types.
//!
//! A task is the unit a caller submits: a deduplicated list of group ids to
//! walk through the groups → posts → comments hierarchy. Its lifecycle:
//!
//! ```text
//! pending → processing → completed
//!    │           │
//!    └───────────┴──────→ failed | cancelled
//! ```
//!
//! Terminal states never change again.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::progress::DEFAULT_COMMENTS_PER_POST;

// =============================================================================
// Task Status
// =============================================================================

/// Status of a collection task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// Created and enqueued, no worker has started it yet.
    Pending,
    /// A worker is walking the hierarchy.
    Processing,
    /// Every phase exhausted its inputs.
    Completed,
    /// Aborted by a fatal error or dead-lettered job.
    Failed,
    /// Stopped at the caller's request.
    Cancelled,
}

impl TaskStatus {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    /// Returns true if the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// `processing → processing` is allowed so that a redelivered job can
    /// resume a task that a crashed worker left behind.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            TaskStatus::Pending => matches!(
                next,
                TaskStatus::Processing | TaskStatus::Failed | TaskStatus::Cancelled
            ),
            TaskStatus::Processing => !matches!(next, TaskStatus::Pending),
            _ => false,
        }
    }

    /// States from which `target` can be reached, for conditional updates.
    pub fn sources_of(target: TaskStatus) -> Vec<TaskStatus> {
        [TaskStatus::Pending, TaskStatus::Processing]
            .into_iter()
            .filter(|s| s.can_transition_to(target))
            .collect()
    }
}

/// Error type for parsing TaskStatus from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseTaskStatusError(String);

impl std::fmt::Display for ParseTaskStatusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid task status: {}", self.0)
    }
}

impl std::error::Error for ParseTaskStatusError {}

impl std::str::FromStr for TaskStatus {
    type Err = ParseTaskStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "processing" => Ok(TaskStatus::Processing),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            "cancelled" => Ok(TaskStatus::Cancelled),
            _ => Err(ParseTaskStatusError(s.to_string())),
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Progress counters of a task.
///
/// Every field only grows over the lifetime of a task. Stores persist updates
/// with [`TaskMetrics::merge`] so a re-executed job never moves them backwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetrics {
    pub groups_total: u64,
    pub groups_processed: u64,
    pub posts_total: u64,
    pub posts_processed: u64,
    pub comments_total: u64,
    pub comments_processed: u64,
    pub estimated_comments_per_post: f64,
    /// Posts phase exhausted its inputs; `posts_total` is final.
    #[serde(default)]
    pub posts_total_exact: bool,
    /// Comments phase exhausted its inputs; `comments_total` is final.
    #[serde(default)]
    pub comments_total_exact: bool,
}

impl Default for TaskMetrics {
    fn default() -> Self {
        Self {
            groups_total: 0,
            groups_processed: 0,
            posts_total: 0,
            posts_processed: 0,
            comments_total: 0,
            comments_processed: 0,
            estimated_comments_per_post: DEFAULT_COMMENTS_PER_POST,
            posts_total_exact: false,
            comments_total_exact: false,
        }
    }
}

impl TaskMetrics {
    /// Metrics of a freshly submitted task.
    pub fn for_groups(groups_total: u64, estimated_comments_per_post: f64) -> Self {
        Self {
            groups_total,
            estimated_comments_per_post,
            ..Self::default()
        }
    }

    /// Field-wise maximum; flags are OR-ed.
    pub fn merge(&mut self, other: &TaskMetrics) {
        self.groups_total = self.groups_total.max(other.groups_total);
        self.groups_processed = self.groups_processed.max(other.groups_processed);
        self.posts_total = self.posts_total.max(other.posts_total);
        self.posts_processed = self.posts_processed.max(other.posts_processed);
        self.comments_total = self.comments_total.max(other.comments_total);
        self.comments_processed = self.comments_processed.max(other.comments_processed);
        if other.estimated_comments_per_post.is_finite() {
            self.estimated_comments_per_post = self
                .estimated_comments_per_post
                .max(other.estimated_comments_per_post);
        }
        self.posts_total_exact |= other.posts_total_exact;
        self.comments_total_exact |= other.comments_total_exact;
    }

    /// Restores `processed <= total` when upstream totals under-report.
    ///
    /// Group totals are fixed at submission, so excess processed groups are
    /// cut down. Post and comment totals are raised instead, but only once
    /// known: an unreported total stays 0 so the calculator keeps estimating.
    pub fn clamp(&mut self) {
        self.groups_processed = self.groups_processed.min(self.groups_total);
        if self.posts_total > 0 || self.posts_total_exact {
            self.posts_total = self.posts_total.max(self.posts_processed);
        }
        if self.comments_total > 0 || self.comments_total_exact {
            self.comments_total = self.comments_total.max(self.comments_processed);
        }
    }
}

// =============================================================================
// Errors recorded on a task
// =============================================================================

/// What an error recorded on a task refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorScope {
    Group,
    Post,
    Comment,
    Task,
}

impl ErrorScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorScope::Group => "group",
            ErrorScope::Post => "post",
            ErrorScope::Comment => "comment",
            ErrorScope::Task => "task",
        }
    }
}

/// An error appended to a task. The list is append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub scope: ErrorScope,
    pub external_id: Option<String>,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
}

impl TaskError {
    pub fn new(scope: ErrorScope, external_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope,
            external_id: Some(external_id.into()),
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }

    /// An error about the task as a whole.
    pub fn task(message: impl Into<String>) -> Self {
        Self {
            scope: ErrorScope::Task,
            external_id: None,
            message: message.into(),
            occurred_at: Utc::now(),
        }
    }
}

// =============================================================================
// Task
// =============================================================================

/// Per-task options supplied at submission.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOptions {
    /// Stop the comments phase after this many comments and cap the estimate.
    pub max_comments: Option<u64>,
    /// Override of the comments-per-post estimate.
    pub estimated_comments_per_post: Option<f64>,
}

/// A collection task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    pub group_ids: Vec<String>,
    pub metrics: TaskMetrics,
    pub errors: Vec<TaskError>,
    pub options: TaskOptions,
    /// Highest percentage ever reported for this task.
    pub progress: u8,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Builds the initial, pending task for a submission.
    pub fn from_new(new_task: NewTask) -> Self {
        let now = Utc::now();
        let metrics = TaskMetrics::for_groups(
            new_task.group_ids.len() as u64,
            new_task
                .options
                .estimated_comments_per_post
                .unwrap_or(DEFAULT_COMMENTS_PER_POST),
        );
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Pending,
            group_ids: new_task.group_ids,
            metrics,
            errors: Vec::new(),
            options: new_task.options,
            progress: 0,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Validated submission: deduplicated, non-empty group ids.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub group_ids: Vec<String>,
    pub options: TaskOptions,
}

impl NewTask {
    /// Validates and deduplicates the submitted group ids.
    ///
    /// Ids are trimmed, blanks dropped, and the first occurrence of each id
    /// wins. An empty result is rejected.
    pub fn new<I, S>(group_ids: I) -> Result<Self, AppError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let group_ids = dedup_group_ids(group_ids);
        if group_ids.is_empty() {
            return Err(AppError::InvalidInput(
                "at least one group id is required".to_string(),
            ));
        }
        Ok(Self {
            group_ids,
            options: TaskOptions::default(),
        })
    }

    pub fn with_max_comments(mut self, max: u64) -> Self {
        self.options.max_comments = Some(max);
        self
    }

    pub fn with_estimated_comments_per_post(mut self, estimate: f64) -> Result<Self, AppError> {
        if !estimate.is_finite() || estimate < 0.0 {
            return Err(AppError::InvalidInput(format!(
                "estimated comments per post must be a non-negative number, got {}",
                estimate
            )));
        }
        self.options.estimated_comments_per_post = Some(estimate);
        Ok(self)
    }
}

/// Order-preserving deduplication of group ids.
pub fn dedup_group_ids<I, S>(group_ids: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut seen = HashSet::new();
    group_ids
        .into_iter()
        .map(|id| id.as_ref().trim().to_string())
        .filter(|id| !id.is_empty())
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
