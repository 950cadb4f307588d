//! Job queue types for durable collection job management.
//!
//! A job is the queue-side handle of a task: the task holds the domain
//! state, the job tracks delivery to workers.
//!
//! # Architecture
//!
//! Jobs flow through these states:
//! ```text
//! waiting → active → completed
//!              ↓
//!            dead (not retryable, or attempts exhausted)
//!              ↓
//!           waiting (retryable, with next_eligible_at = now + backoff)
//! ```
//!
//! An active job whose visibility deadline passes is reclaimed as if it had
//! failed with a retryable error. Every delivery increments `attempt`, so a
//! reclaim counts against `max_attempts`.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::env_or;
use crate::error::AppError;

// =============================================================================
// Job State
// =============================================================================

/// State of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting to be delivered, possibly not before `next_eligible_at`.
    Waiting,
    /// Delivered to a worker and invisible to others until the deadline.
    Active,
    /// Acknowledged.
    Completed,
    /// Dead-lettered: not retried any more.
    Dead,
}

impl JobState {
    /// Returns the string representation for database storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Dead => "dead",
        }
    }

    /// Returns true if the job will never be delivered again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }
}

/// Error type for parsing JobState from string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseJobStateError(String);

impl std::fmt::Display for ParseJobStateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid job state: {}", self.0)
    }
}

impl std::error::Error for ParseJobStateError {}

impl std::str::FromStr for JobState {
    type Err = ParseJobStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(JobState::Waiting),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "dead" => Ok(JobState::Dead),
            _ => Err(ParseJobStateError(s.to_string())),
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Body of the `collect_task.v1` payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectTaskPayload {
    pub task_id: Uuid,
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Versioned job payload.
///
/// Serialized with an explicit `kind` tag. New payload shapes get a new
/// variant; a worker that meets an unknown kind fails to deserialize the job
/// instead of running the wrong code on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum JobPayload {
    #[serde(rename = "collect_task.v1")]
    CollectTaskV1(CollectTaskPayload),
}

impl JobPayload {
    pub fn collect_task(task_id: Uuid, enqueued_at: DateTime<Utc>) -> Self {
        JobPayload::CollectTaskV1(CollectTaskPayload {
            task_id,
            attempt: 0,
            enqueued_at,
        })
    }

    pub fn task_id(&self) -> Uuid {
        match self {
            JobPayload::CollectTaskV1(p) => p.task_id,
        }
    }

    /// Copy of the payload stamped with the current delivery attempt.
    pub fn with_attempt(&self, attempt: u32) -> Self {
        match self {
            JobPayload::CollectTaskV1(p) => JobPayload::CollectTaskV1(CollectTaskPayload {
                attempt,
                ..p.clone()
            }),
        }
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Shape of the delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackoffMode {
    /// `base × 2^(attempt-1)`, capped.
    Exponential,
    /// Always `base`.
    Fixed,
}

/// Delay before a failed job becomes eligible again.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub mode: BackoffMode,
    pub base_delay: TimeDelta,
    pub max_delay: TimeDelta,
    /// Equal jitter: half of the delay is randomized.
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            mode: BackoffMode::Exponential,
            base_delay: TimeDelta::seconds(1),
            max_delay: TimeDelta::seconds(60),
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Exponential backoff without jitter.
    pub fn exponential(base_delay: TimeDelta, max_delay: TimeDelta) -> Self {
        Self {
            mode: BackoffMode::Exponential,
            base_delay,
            max_delay,
            jitter: false,
        }
    }

    /// The same delay for every attempt.
    pub fn fixed(delay: TimeDelta) -> Self {
        Self {
            mode: BackoffMode::Fixed,
            base_delay: delay,
            max_delay: delay,
            jitter: false,
        }
    }

    /// No delay at all. Useful in tests.
    pub fn immediate() -> Self {
        Self::fixed(TimeDelta::zero())
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay for a given attempt before jitter.
    ///
    /// - Attempt 1: base
    /// - Attempt 2: 2 × base
    /// - Attempt n: base × 2^(n-1), capped at `max_delay`
    pub fn delay_for_attempt(&self, attempt: u32) -> TimeDelta {
        if attempt == 0 {
            return TimeDelta::zero();
        }
        let delay = match self.mode {
            BackoffMode::Fixed => self.base_delay,
            BackoffMode::Exponential => {
                let factor = 1i32.checked_shl(attempt.saturating_sub(1).min(30)).unwrap_or(i32::MAX);
                self.base_delay.checked_mul(factor).unwrap_or(self.max_delay)
            }
        };
        std::cmp::min(delay, self.max_delay)
    }

    /// Delay for a given attempt with jitter applied when enabled.
    ///
    /// With jitter the result lies in `[delay / 2, delay]`.
    pub fn jittered_delay(&self, attempt: u32) -> TimeDelta {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter {
            return delay;
        }
        let millis = delay.num_milliseconds().max(0);
        let half = millis / 2;
        let spread = rand::thread_rng().gen_range(0..=millis - half);
        TimeDelta::milliseconds(half + spread)
    }
}

// =============================================================================
// Job
// =============================================================================

/// A job in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: Uuid,

    /// Task this job executes.
    pub task_id: Uuid,

    pub payload: JobPayload,

    pub state: JobState,

    /// Number of deliveries so far.
    pub attempt: u32,

    pub max_attempts: u32,

    /// Higher is dequeued first.
    pub priority: i16,

    /// Not delivered before this instant.
    pub next_eligible_at: DateTime<Utc>,

    /// Active jobs become reclaimable after this instant.
    pub visibility_deadline: Option<DateTime<Utc>>,

    /// ID of the worker holding this job.
    pub worker_id: Option<String>,

    /// Error of the last failed attempt.
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// Where a failed or reclaimed job goes next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobTransition {
    Retry { next_eligible_at: DateTime<Utc> },
    Dead,
}

impl Job {
    /// A new waiting job for `task_id`, eligible immediately.
    pub fn new(task_id: Uuid, max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            task_id,
            payload: JobPayload::collect_task(task_id, now),
            state: JobState::Waiting,
            attempt: 0,
            max_attempts: max_attempts.max(1),
            priority: 0,
            next_eligible_at: now,
            visibility_deadline: None,
            worker_id: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the job can be attempted again.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }

    /// Whether the job is active but its lease has run out.
    /// Whether the job is active and delivered to `worker_id`.
    pub fn is_held_by(&self, worker_id: &str) -> bool {
        self.state == JobState::Active && self.worker_id.as_deref() == Some(worker_id)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Active
            && self.visibility_deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Decides what happens to this job after a failed attempt.
    pub fn transition_after_failure(
        &self,
        retryable: bool,
        backoff: &BackoffConfig,
        now: DateTime<Utc>,
    ) -> JobTransition {
        if retryable && self.can_retry() {
            JobTransition::Retry {
                next_eligible_at: now + backoff.jittered_delay(self.attempt),
            }
        } else {
            JobTransition::Dead
        }
    }

    /// Applies a delivery to `worker_id` (in-memory bookkeeping).
    pub fn deliver(&mut self, worker_id: &str, visibility_timeout: TimeDelta, now: DateTime<Utc>) {
        self.state = JobState::Active;
        self.attempt += 1;
        self.payload = self.payload.with_attempt(self.attempt);
        self.worker_id = Some(worker_id.to_string());
        self.visibility_deadline = Some(now + visibility_timeout);
        self.updated_at = now;
    }

    /// Applies a failure transition (in-memory bookkeeping).
    pub fn apply(&mut self, transition: JobTransition, error: &str, now: DateTime<Utc>) {
        match transition {
            JobTransition::Retry { next_eligible_at } => {
                self.state = JobState::Waiting;
                self.next_eligible_at = next_eligible_at;
            }
            JobTransition::Dead => self.state = JobState::Dead,
        }
        self.worker_id = None;
        self.visibility_deadline = None;
        self.last_error = Some(error.to_string());
        self.updated_at = now;
    }
}

// =============================================================================
// Queue Configuration
// =============================================================================

/// Behaviour of a job queue backend.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// How long a delivered job stays invisible without a heartbeat.
    pub visibility_timeout: TimeDelta,
    pub backoff: BackoffConfig,
    /// Attempts allowed for newly enqueued jobs.
    pub max_attempts: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: TimeDelta::minutes(5),
            backoff: BackoffConfig::default(),
            max_attempts: 3,
        }
    }
}

impl QueueConfig {
    /// Reads `GATHER_VISIBILITY_TIMEOUT_SECS` and `GATHER_JOB_MAX_ATTEMPTS`.
    pub fn from_env() -> Result<Self, AppError> {
        let default = Self::default();
        let timeout_secs = env_or(
            "GATHER_VISIBILITY_TIMEOUT_SECS",
            default.visibility_timeout.num_seconds(),
        )?;
        Ok(default
            .with_visibility_timeout(TimeDelta::seconds(timeout_secs.max(1)))
            .with_max_attempts(env_or("GATHER_JOB_MAX_ATTEMPTS", 3)?))
    }

    pub fn with_visibility_timeout(mut self, timeout: TimeDelta) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }
}

// =============================================================================
// Worker Configuration
// =============================================================================

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Unique worker identifier.
    pub worker_id: String,
    /// How often to poll for new jobs.
    pub poll_interval: std::time::Duration,
    /// How often an active job's visibility deadline is extended.
    pub heartbeat_interval: std::time::Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: std::time::Duration::from_secs(2),
            heartbeat_interval: std::time::Duration::from_secs(60),
        }
    }
}

impl WorkerConfig {
    /// Reads `GATHER_POLL_INTERVAL_SECS` and `GATHER_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<Self, AppError> {
        let default = Self::default();
        let poll = env_or("GATHER_POLL_INTERVAL_SECS", default.poll_interval.as_secs())?;
        let heartbeat = env_or(
            "GATHER_HEARTBEAT_SECS",
            default.heartbeat_interval.as_secs(),
        )?;
        Ok(default
            .with_poll_interval(std::time::Duration::from_secs(poll.max(1)))
            .with_heartbeat_interval(std::time::Duration::from_secs(heartbeat.max(1))))
    }

    /// Set the worker ID.
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: std::time::Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }
}

// =============================================================================
// Tests
// =============================================================================
