//! In-memory backend implementing the queue, the task store and the result store.
//!
//! All state lives behind one mutex, which gives the same guarantees the
//! PostgreSQL backend gets from transactions: task creation and enqueue are
//! atomic, and a job is never active for two workers. The lock is never held
//! across an `.await`.
//!
//! Used for embedding the subsystem without a database and for tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::AppError;
use crate::job::{Job, JobState, QueueConfig};
use crate::job_queue::{FailOutcome, JobQueue, ReapOutcome};
use crate::models::{Comment, Group, Post};
use crate::task::{NewTask, Task, TaskError, TaskStatus};
use crate::traits::{ProgressUpdate, RecordCounts, ResultStore, TaskStore};

#[derive(Default)]
struct State {
    tasks: HashMap<Uuid, Task>,
    jobs: HashMap<Uuid, Job>,
    groups: BTreeMap<(Uuid, String), Group>,
    posts: BTreeMap<(Uuid, String), Post>,
    comments: BTreeMap<(Uuid, String), Comment>,
}

/// Shared in-memory backend. Clones share state.
#[derive(Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
    available: Arc<AtomicBool>,
    config: QueueConfig,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl MemoryBackend {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            available: Arc::new(AtomicBool::new(true)),
            config,
        }
    }

    pub fn queue_config(&self) -> &QueueConfig {
        &self.config
    }

    /// Simulates an outage: every operation fails with `StoreUnavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, AppError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(AppError::StoreUnavailable(
                "in-memory backend is offline".to_string(),
            ));
        }
        self.state
            .lock()
            .map_err(|_| AppError::StoreUnavailable("in-memory backend lock poisoned".to_string()))
    }

    /// Number of tasks ever created.
    pub fn task_count(&self) -> Result<usize, AppError> {
        Ok(self.lock()?.tasks.len())
    }

    /// All posts stored for a task.
    pub fn posts_of(&self, task_id: Uuid) -> Result<Vec<Post>, AppError> {
        Ok(self
            .lock()?
            .posts
            .iter()
            .filter(|((id, _), _)| *id == task_id)
            .map(|(_, post)| post.clone())
            .collect())
    }

    /// All comments stored for a task.
    pub fn comments_of(&self, task_id: Uuid) -> Result<Vec<Comment>, AppError> {
        Ok(self
            .lock()?
            .comments
            .iter()
            .filter(|((id, _), _)| *id == task_id)
            .map(|(_, comment)| comment.clone())
            .collect())
    }
}

fn task_mut(state: &mut State, id: Uuid) -> Result<&mut Task, AppError> {
    state.tasks.get_mut(&id).ok_or(AppError::TaskNotFound(id))
}

fn job_mut(state: &mut State, id: Uuid) -> Result<&mut Job, AppError> {
    state.jobs.get_mut(&id).ok_or(AppError::JobNotFound(id))
}

fn upsert<T: Clone>(
    map: &mut BTreeMap<(Uuid, String), T>,
    task_id: Uuid,
    items: &[T],
    key: impl Fn(&T) -> &str,
) -> u64 {
    for item in items {
        map.insert((task_id, key(item).to_string()), item.clone());
    }
    items.len() as u64
}

fn count_for<T>(map: &BTreeMap<(Uuid, String), T>, task_id: Uuid) -> u64 {
    map.keys().filter(|(id, _)| *id == task_id).count() as u64
}

// =============================================================================
// TaskStore
// =============================================================================

impl TaskStore for MemoryBackend {
    async fn create_task(&self, new_task: NewTask, max_attempts: u32) -> Result<(Task, Job), AppError> {
        let task = Task::from_new(new_task);
        let job = Job::new(task.id, max_attempts);

        let mut state = self.lock()?;
        state.tasks.insert(task.id, task.clone());
        state.jobs.insert(job.id, job.clone());

        Ok((task, job))
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, AppError> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    async fn mark_processing(&self, id: Uuid) -> Result<Task, AppError> {
        let mut state = self.lock()?;
        let task = task_mut(&mut state, id)?;

        if task.status.can_transition_to(TaskStatus::Processing) {
            let now = Utc::now();
            task.status = TaskStatus::Processing;
            task.started_at.get_or_insert(now);
            task.updated_at = now;
        }

        Ok(task.clone())
    }

    async fn record_progress(&self, id: Uuid, update: &ProgressUpdate) -> Result<(), AppError> {
        let mut state = self.lock()?;
        let task = task_mut(&mut state, id)?;

        task.metrics.merge(&update.metrics);
        task.metrics.clamp();
        task.errors.extend(update.errors.iter().cloned());
        task.progress = task.progress.max(update.percentage);
        task.updated_at = Utc::now();

        Ok(())
    }

    async fn finish_task(
        &self,
        id: Uuid,
        status: TaskStatus,
        error: Option<TaskError>,
    ) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let task = task_mut(&mut state, id)?;

        if !status.is_terminal() || !task.status.can_transition_to(status) {
            return Ok(false);
        }

        let now = Utc::now();
        task.status = status;
        task.finished_at.get_or_insert(now);
        task.updated_at = now;
        task.errors.extend(error);

        Ok(true)
    }

    async fn request_cancel(&self, id: Uuid) -> Result<TaskStatus, AppError> {
        let mut state = self.lock()?;
        let task = task_mut(&mut state, id)?;
        let now = Utc::now();

        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.cancel_requested = true;
                task.finished_at.get_or_insert(now);
                task.updated_at = now;
            }
            TaskStatus::Processing => {
                task.cancel_requested = true;
                task.updated_at = now;
            }
            _ => {}
        }

        Ok(task.status)
    }

    async fn is_cancel_requested(&self, id: Uuid) -> Result<bool, AppError> {
        let state = self.lock()?;
        state
            .tasks
            .get(&id)
            .map(|task| task.cancel_requested)
            .ok_or(AppError::TaskNotFound(id))
    }
}

// =============================================================================
// ResultStore
// =============================================================================

impl ResultStore for MemoryBackend {
    async fn upsert_groups(&self, task_id: Uuid, groups: &[Group]) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        Ok(upsert(&mut state.groups, task_id, groups, |g| g.external_id.as_str()))
    }

    async fn upsert_posts(&self, task_id: Uuid, posts: &[Post]) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        Ok(upsert(&mut state.posts, task_id, posts, |p| p.external_id.as_str()))
    }

    async fn upsert_comments(&self, task_id: Uuid, comments: &[Comment]) -> Result<u64, AppError> {
        let mut state = self.lock()?;
        Ok(upsert(&mut state.comments, task_id, comments, |c| c.external_id.as_str()))
    }

    async fn list_groups(&self, task_id: Uuid) -> Result<Vec<Group>, AppError> {
        let state = self.lock()?;
        Ok(state
            .groups
            .iter()
            .filter(|((id, _), _)| *id == task_id)
            .map(|(_, group)| group.clone())
            .collect())
    }

    async fn count_records(&self, task_id: Uuid) -> Result<RecordCounts, AppError> {
        let state = self.lock()?;
        Ok(RecordCounts {
            groups: count_for(&state.groups, task_id),
            posts: count_for(&state.posts, task_id),
            comments: count_for(&state.comments, task_id),
        })
    }
}

// =============================================================================
// JobQueue
// =============================================================================

impl JobQueue for MemoryBackend {
    async fn enqueue(&self, task_id: Uuid, max_attempts: u32) -> Result<Job, AppError> {
        let mut state = self.lock()?;
        if !state.tasks.contains_key(&task_id) {
            return Err(AppError::TaskNotFound(task_id));
        }
        let job = Job::new(task_id, max_attempts);
        state.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, AppError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let next = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Waiting && job.next_eligible_at <= now)
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.next_eligible_at.cmp(&b.next_eligible_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id);

        let Some(job_id) = next else {
            return Ok(None);
        };
        let job = job_mut(&mut state, job_id)?;
        job.deliver(worker_id, self.config.visibility_timeout, now);
        Ok(Some(job.clone()))
    }

    async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let job = job_mut(&mut state, job_id)?;
        if !job.is_held_by(worker_id) {
            return Ok(false);
        }
        job.state = JobState::Completed;
        job.worker_id = None;
        job.visibility_deadline = None;
        job.updated_at = Utc::now();
        Ok(true)
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        retryable: bool,
        error: &str,
    ) -> Result<FailOutcome, AppError> {
        let mut state = self.lock()?;
        let job = job_mut(&mut state, job_id)?;
        if !job.is_held_by(worker_id) {
            return Ok(FailOutcome::NotHeld);
        }
        let now = Utc::now();

        let transition = job.transition_after_failure(retryable, &self.config.backoff, now);
        job.apply(transition, error, now);

        Ok(match job.state {
            JobState::Dead => FailOutcome::Dead,
            _ => FailOutcome::Retrying {
                next_eligible_at: job.next_eligible_at,
            },
        })
    }

    async fn release(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let job = job_mut(&mut state, job_id)?;
        if !job.is_held_by(worker_id) {
            return Ok(false);
        }
        let now = Utc::now();
        job.state = JobState::Waiting;
        job.attempt = job.attempt.saturating_sub(1);
        job.worker_id = None;
        job.visibility_deadline = None;
        job.next_eligible_at = now;
        job.updated_at = now;
        Ok(true)
    }

    async fn extend_visibility(&self, job_id: Uuid, worker_id: &str) -> Result<bool, AppError> {
        let mut state = self.lock()?;
        let job = job_mut(&mut state, job_id)?;
        if !job.is_held_by(worker_id) {
            return Ok(false);
        }
        let now = Utc::now();
        job.visibility_deadline = Some(now + self.config.visibility_timeout);
        job.updated_at = now;
        Ok(true)
    }

    async fn reap_expired(&self, now: DateTime<Utc>) -> Result<ReapOutcome, AppError> {
        let mut state = self.lock()?;
        let mut outcome = ReapOutcome::default();
        let clock = Utc::now();

        for job in state.jobs.values_mut().filter(|job| job.is_expired(now)) {
            let transition = job.transition_after_failure(true, &self.config.backoff, clock);
            job.apply(transition, "visibility timeout expired", clock);
            if job.state == JobState::Dead {
                outcome.dead.push(job.clone());
            } else {
                outcome.redelivered += 1;
            }
        }

        Ok(outcome)
    }

    async fn list_unsettled_dead(&self, limit: usize) -> Result<Vec<Job>, AppError> {
        let state = self.lock()?;
        let is_latest = |job: &Job| {
            !state
                .jobs
                .values()
                .any(|other| other.task_id == job.task_id && other.created_at > job.created_at)
        };
        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| job.state == JobState::Dead)
            .filter(|job| {
                state
                    .tasks
                    .get(&job.task_id)
                    .is_some_and(|task| !task.status.is_terminal())
            })
            .filter(|job| is_latest(*job))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.updated_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn prioritize(&self, task_id: Uuid) -> Result<Option<Job>, AppError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let job = state
            .jobs
            .values_mut()
            .find(|job| job.task_id == task_id && job.state == JobState::Waiting);

        Ok(job.map(|job| {
            job.priority = job.priority.max(1);
            job.next_eligible_at = job.next_eligible_at.min(now);
            job.updated_at = now;
            job.clone()
        }))
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, AppError> {
        Ok(self.lock()?.jobs.get(&job_id).cloned())
    }

    async fn find_by_task(&self, task_id: Uuid) -> Result<Option<Job>, AppError> {
        let state = self.lock()?;
        Ok(state
            .jobs
            .values()
            .filter(|job| job.task_id == task_id)
            .max_by_key(|job| job.created_at)
            .cloned())
    }

    async fn list_by_state(&self, state: JobState, limit: usize) -> Result<Vec<Job>, AppError> {
        let guard = self.lock()?;
        let mut jobs: Vec<Job> = guard
            .jobs
            .values()
            .filter(|job| job.state == state)
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn count_by_state(&self, state: JobState) -> Result<u64, AppError> {
        let guard = self.lock()?;
        Ok(guard.jobs.values().filter(|job| job.state == state).count() as u64)
    }
}
