//! Request DTOs for API endpoints.

use serde::Deserialize;
use utoipa::{IntoParams, ToSchema};

use gather_core::{JobState, TaskOptions};

use crate::error::ApiError;

/// Maximum number of group ids accepted in one submission.
pub const MAX_GROUPS_PER_TASK: usize = 1_000;

/// Default and maximum page size for job listings.
pub const DEFAULT_JOBS_LIMIT: usize = 50;
pub const MAX_JOBS_LIMIT: usize = 500;

/// Request body for submitting a collection task.
#[derive(Debug, Deserialize, ToSchema)]
pub struct SubmitTaskRequest {
    /// Platform group identifiers; duplicates and blanks are dropped
    #[schema(example = json!(["123456789", "987654321"]))]
    pub group_ids: Vec<String>,

    /// Stop counting comments beyond this many per task
    #[serde(default)]
    pub max_comments: Option<u64>,

    /// Comments expected per post while post totals are unknown
    #[serde(default)]
    pub estimated_comments_per_post: Option<f64>,
}

impl SubmitTaskRequest {
    /// Checks request-level limits and extracts the task options.
    pub fn validate(&self) -> Result<TaskOptions, ApiError> {
        if self.group_ids.len() > MAX_GROUPS_PER_TASK {
            return Err(ApiError::BadRequest(format!(
                "at most {} group ids per task, got {}",
                MAX_GROUPS_PER_TASK,
                self.group_ids.len()
            )));
        }
        Ok(TaskOptions {
            max_comments: self.max_comments,
            estimated_comments_per_post: self.estimated_comments_per_post,
        })
    }
}

/// Query parameters for job listings.
#[derive(Debug, Default, Deserialize, IntoParams, ToSchema)]
pub struct JobsQuery {
    /// Job state: waiting, active, completed or dead (default: waiting)
    #[param(example = "waiting")]
    pub state: Option<String>,

    /// Maximum number of jobs returned (default: 50, max: 500)
    #[param(example = 50)]
    pub limit: Option<usize>,
}

impl JobsQuery {
    pub fn parse(&self) -> Result<(JobState, usize), ApiError> {
        let state = match self.state.as_deref() {
            None => JobState::Waiting,
            Some(raw) => raw
                .parse::<JobState>()
                .map_err(|_| ApiError::BadRequest(format!("unknown job state: {}", raw)))?,
        };
        let limit = self
            .limit
            .unwrap_or(DEFAULT_JOBS_LIMIT)
            .clamp(1, MAX_JOBS_LIMIT);
        Ok((state, limit))
    }
}
