//! Integration tests for JobRepository.
//!
//! These tests verify delivery order, exclusive claiming under concurrency,
//! retry and dead-letter transitions, and the visibility timeout reaper.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use gather_core::job::{BackoffConfig, JobPayload, JobState, QueueConfig};
use gather_core::job_queue::{FailOutcome, JobQueue};
use gather_core::task::{NewTask, TaskError, TaskStatus};
use gather_core::traits::TaskStore;
use gather_core::AppError;
use gather_db::{JobRepository, TaskRepository};
use sqlx::PgPool;
use uuid::Uuid;

use crate::integration::common::setup_test_db;

fn immediate_config() -> QueueConfig {
    QueueConfig::default().with_backoff(BackoffConfig::immediate())
}

/// Creates a task and returns its id; the job is enqueued alongside it.
async fn submit(pool: &PgPool, max_attempts: u32) -> Uuid {
    let tasks = TaskRepository::new(pool.clone());
    let (task, _) = tasks
        .create_task(NewTask::new(["g1"]).unwrap(), max_attempts)
        .await
        .expect("create should succeed");
    task.id
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dequeue_empty_queue_returns_none() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool);

    let job = jobs.dequeue("w-1").await.unwrap();

    assert!(job.is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_dequeue_is_fifo_and_stamps_attempt() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    let first = submit(&pool, 3).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let second = submit(&pool, 3).await;

    let a = jobs.dequeue("w-1").await.unwrap().expect("first job");
    let b = jobs.dequeue("w-1").await.unwrap().expect("second job");

    assert_eq!(a.task_id, first);
    assert_eq!(b.task_id, second);
    assert_eq!(a.state, JobState::Active);
    assert_eq!(a.attempt, 1);
    assert_eq!(a.worker_id.as_deref(), Some("w-1"));
    assert!(a.visibility_deadline.is_some());
    let JobPayload::CollectTaskV1(payload) = &a.payload;
    assert_eq!(payload.attempt, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_concurrent_workers_never_share_a_job() {
    // Arrange
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    for _ in 0..12 {
        submit(&pool, 3).await;
    }

    // Act
    let mut handles = Vec::new();
    for w in 0..4 {
        let jobs = jobs.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w-{}", w);
            let mut claimed = Vec::new();
            while let Some(job) = jobs.dequeue(&worker_id).await.unwrap() {
                claimed.push(job.id);
            }
            claimed
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    // Assert
    let unique: HashSet<Uuid> = all.iter().copied().collect();
    assert_eq!(all.len(), 12);
    assert_eq!(unique.len(), 12);
    assert_eq!(jobs.count_by_state(JobState::Active).await.unwrap(), 12);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_retryable_failure_retries_then_dead_letters() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::with_config(pool.clone(), immediate_config());
    submit(&pool, 2).await;

    let job = jobs.dequeue("w-1").await.unwrap().unwrap();
    let outcome = jobs.fail(job.id, "w-1", true, "HTTP 503").await.unwrap();
    assert!(matches!(outcome, FailOutcome::Retrying { .. }));

    let stored = jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.last_error.as_deref(), Some("HTTP 503"));
    assert!(stored.worker_id.is_none());

    let again = jobs.dequeue("w-2").await.unwrap().expect("redelivered");
    assert_eq!(again.id, job.id);
    assert_eq!(again.attempt, 2);

    let outcome = jobs.fail(job.id, "w-2", true, "HTTP 503").await.unwrap();
    assert_eq!(outcome, FailOutcome::Dead);
    assert_eq!(jobs.get_job(job.id).await.unwrap().unwrap().state, JobState::Dead);
    assert!(jobs.dequeue("w-1").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_non_retryable_failure_is_dead_immediately() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::with_config(pool.clone(), immediate_config());
    submit(&pool, 5).await;

    let job = jobs.dequeue("w-1").await.unwrap().unwrap();
    let outcome = jobs.fail(job.id, "w-1", false, "invalid group id").await.unwrap();

    assert_eq!(outcome, FailOutcome::Dead);
    assert_eq!(jobs.count_by_state(JobState::Dead).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_backoff_delays_redelivery() {
    let (pool, _container) = setup_test_db().await;
    let config = QueueConfig::default().with_backoff(BackoffConfig::fixed(TimeDelta::minutes(10)));
    let jobs = JobRepository::with_config(pool.clone(), config);
    submit(&pool, 3).await;

    let job = jobs.dequeue("w-1").await.unwrap().unwrap();
    jobs.fail(job.id, "w-1", true, "timeout").await.unwrap();

    assert!(jobs.dequeue("w-1").await.unwrap().is_none());
    let stored = jobs.get_job(job.id).await.unwrap().unwrap();
    assert!(stored.next_eligible_at > Utc::now() + TimeDelta::minutes(9));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_release_returns_job_without_spending_an_attempt() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    submit(&pool, 3).await;

    let job = jobs.dequeue("w-1").await.unwrap().unwrap();
    assert!(jobs.release(job.id, "w-1").await.unwrap());

    let stored = jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Waiting);
    assert_eq!(stored.attempt, 0);
    let again = jobs.dequeue("w-2").await.unwrap().expect("released job is available");
    assert_eq!(again.attempt, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_extend_visibility_requires_ownership() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    submit(&pool, 3).await;
    let job = jobs.dequeue("w-1").await.unwrap().unwrap();

    assert!(jobs.extend_visibility(job.id, "w-1").await.unwrap());
    assert!(!jobs.extend_visibility(job.id, "w-2").await.unwrap());

    assert!(jobs.ack(job.id, "w-1").await.unwrap());
    assert!(!jobs.extend_visibility(job.id, "w-1").await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reap_expired_redelivers_then_dead_letters() {
    // Arrange
    let (pool, _container) = setup_test_db().await;
    let config = immediate_config().with_visibility_timeout(TimeDelta::zero());
    let jobs = JobRepository::with_config(pool.clone(), config);
    let task_id = submit(&pool, 2).await;

    // Act: a worker claims the job and never reports back, twice
    let job = jobs.dequeue("w-crashed").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let first = jobs.reap_expired(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    jobs.dequeue("w-crashed").await.unwrap().expect("redelivered");
    tokio::time::sleep(Duration::from_millis(20)).await;
    let second = jobs.reap_expired(Utc::now()).await.unwrap();

    // Assert
    assert_eq!(first.redelivered, 1);
    assert!(first.dead.is_empty());
    assert_eq!(second.redelivered, 0);
    assert_eq!(second.dead.len(), 1);
    assert_eq!(second.dead[0].task_id, task_id);
    assert_eq!(
        second.dead[0].last_error.as_deref(),
        Some("visibility timeout expired")
    );
    assert_eq!(jobs.get_job(job.id).await.unwrap().unwrap().state, JobState::Dead);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_stale_holder_cannot_settle_redelivered_job() {
    // Arrange
    let (pool, _container) = setup_test_db().await;
    let config = immediate_config().with_visibility_timeout(TimeDelta::zero());
    let jobs = JobRepository::with_config(pool.clone(), config);
    submit(&pool, 3).await;

    let job = jobs.dequeue("w-a").await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    jobs.reap_expired(Utc::now()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let redelivered = jobs.dequeue("w-b").await.unwrap().expect("redelivered");
    assert_eq!(redelivered.id, job.id);

    // Act
    let late_fail = jobs.fail(job.id, "w-a", true, "late").await.unwrap();
    let late_ack = jobs.ack(job.id, "w-a").await.unwrap();
    let late_release = jobs.release(job.id, "w-a").await.unwrap();

    // Assert
    assert_eq!(late_fail, FailOutcome::NotHeld);
    assert!(!late_ack);
    assert!(!late_release);
    let stored = jobs.get_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.state, JobState::Active);
    assert_eq!(stored.worker_id.as_deref(), Some("w-b"));
    assert!(jobs.dequeue("w-c").await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_list_unsettled_dead_skips_finished_and_superseded_tasks() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::with_config(pool.clone(), immediate_config());
    let tasks = TaskRepository::new(pool.clone());
    let open = submit(&pool, 3).await;
    let settled = submit(&pool, 3).await;
    while jobs.dequeue("w-1").await.unwrap().is_some() {}
    for job in jobs.list_by_state(JobState::Active, 10).await.unwrap() {
        jobs.fail(job.id, "w-1", false, "boom").await.unwrap();
    }
    tasks
        .finish_task(settled, TaskStatus::Failed, Some(TaskError::task("boom")))
        .await
        .unwrap();

    let unsettled = jobs.list_unsettled_dead(10).await.unwrap();

    assert_eq!(unsettled.len(), 1);
    assert_eq!(unsettled[0].task_id, open);

    tokio::time::sleep(Duration::from_millis(5)).await;
    jobs.enqueue(open, 3).await.unwrap();
    assert!(jobs.list_unsettled_dead(10).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_reap_ignores_leases_within_deadline() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    submit(&pool, 3).await;
    jobs.dequeue("w-1").await.unwrap().unwrap();

    let outcome = jobs.reap_expired(Utc::now()).await.unwrap();

    assert_eq!(outcome.redelivered, 0);
    assert!(outcome.dead.is_empty());
    assert_eq!(jobs.count_by_state(JobState::Active).await.unwrap(), 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_prioritize_moves_job_to_front() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    submit(&pool, 3).await;
    tokio::time::sleep(Duration::from_millis(5)).await;
    let late = submit(&pool, 3).await;

    let bumped = jobs.prioritize(late).await.unwrap().expect("waiting job");
    let next = jobs.dequeue("w-1").await.unwrap().unwrap();

    assert_eq!(bumped.task_id, late);
    assert_eq!(next.task_id, late);
    // Nothing left to bump once the job is active.
    assert!(jobs.prioritize(late).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_ack_unknown_job_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool);

    let result = jobs.ack(Uuid::new_v4(), "w-1").await;

    assert!(matches!(result, Err(AppError::JobNotFound(_))));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_enqueue_for_unknown_task_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool);

    let result = jobs.enqueue(Uuid::new_v4(), 3).await;

    assert!(matches!(result, Err(AppError::TaskNotFound(_))));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_list_and_count_by_state() {
    let (pool, _container) = setup_test_db().await;
    let jobs = JobRepository::new(pool.clone());
    for _ in 0..3 {
        submit(&pool, 3).await;
    }
    let job = jobs.dequeue("w-1").await.unwrap().unwrap();
    assert!(jobs.ack(job.id, "w-1").await.unwrap());

    assert_eq!(jobs.count_by_state(JobState::Waiting).await.unwrap(), 2);
    assert_eq!(jobs.count_by_state(JobState::Completed).await.unwrap(), 1);
    assert_eq!(jobs.list_by_state(JobState::Waiting, 10).await.unwrap().len(), 2);
    assert_eq!(jobs.list_by_state(JobState::Waiting, 1).await.unwrap().len(), 1);
}
