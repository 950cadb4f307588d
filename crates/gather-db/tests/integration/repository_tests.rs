//! Integration tests for TaskRepository.
//!
//! These tests verify task state transitions, monotonic progress merges and
//! idempotent result upserts against a real PostgreSQL database.

use gather_core::job::JobState;
use gather_core::task::{ErrorScope, NewTask, TaskError, TaskMetrics, TaskStatus};
use gather_core::traits::{ProgressUpdate, ResultStore, TaskStore};
use gather_core::{AppError, JobQueue};
use gather_db::{JobRepository, TaskRepository};
use uuid::Uuid;

use crate::integration::common::{comment, group, post, setup_test_db};

fn new_task(ids: &[&str]) -> NewTask {
    NewTask::new(ids.iter().copied()).expect("valid group ids")
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_create_task_enqueues_job_atomically() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool.clone());
    let jobs = JobRepository::new(pool);

    let (task, job) = tasks
        .create_task(new_task(&["g1", "g2", "g1"]), 3)
        .await
        .expect("create should succeed");

    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.group_ids, vec!["g1", "g2"]);
    assert_eq!(task.metrics.groups_total, 2);
    assert_eq!(job.task_id, task.id);
    assert_eq!(job.state, JobState::Waiting);

    let stored = tasks.get_task(task.id).await.unwrap().expect("task exists");
    assert_eq!(stored.group_ids, task.group_ids);
    let queued = jobs.find_by_task(task.id).await.unwrap().expect("job exists");
    assert_eq!(queued.id, job.id);
    assert_eq!(queued.max_attempts, 3);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_get_unknown_task_returns_none() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);

    let task = tasks.get_task(Uuid::new_v4()).await.expect("query succeeds");

    assert!(task.is_none());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_mark_processing_then_finish() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();

    let running = tasks.mark_processing(task.id).await.unwrap();
    assert_eq!(running.status, TaskStatus::Processing);
    assert!(running.started_at.is_some());

    let finished = tasks
        .finish_task(task.id, TaskStatus::Completed, None)
        .await
        .unwrap();
    assert!(finished);

    // Terminal states are final.
    let again = tasks
        .finish_task(task.id, TaskStatus::Failed, Some(TaskError::task("late")))
        .await
        .unwrap();
    assert!(!again);

    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.finished_at.is_some());
    assert!(stored.errors.is_empty());

    // Redelivery of a finished task leaves it untouched.
    let redelivered = tasks.mark_processing(task.id).await.unwrap();
    assert_eq!(redelivered.status, TaskStatus::Completed);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_finish_unknown_task_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);

    let result = tasks
        .finish_task(Uuid::new_v4(), TaskStatus::Completed, None)
        .await;

    assert!(matches!(result, Err(AppError::TaskNotFound(_))));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_record_progress_never_moves_backwards() {
    // Arrange
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1", "g2"]), 3).await.unwrap();

    let ahead = ProgressUpdate {
        metrics: TaskMetrics {
            groups_total: 2,
            groups_processed: 2,
            posts_total: 10,
            posts_processed: 6,
            ..TaskMetrics::default()
        },
        errors: vec![TaskError::new(ErrorScope::Post, "p-3", "deleted")],
        percentage: 40,
    };
    let stale = ProgressUpdate {
        metrics: TaskMetrics {
            groups_total: 2,
            groups_processed: 1,
            posts_total: 8,
            posts_processed: 2,
            posts_total_exact: true,
            ..TaskMetrics::default()
        },
        errors: vec![],
        percentage: 12,
    };

    // Act
    tasks.record_progress(task.id, &ahead).await.unwrap();
    tasks.record_progress(task.id, &stale).await.unwrap();

    // Assert
    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert_eq!(stored.metrics.groups_processed, 2);
    assert_eq!(stored.metrics.posts_total, 10);
    assert_eq!(stored.metrics.posts_processed, 6);
    assert!(stored.metrics.posts_total_exact);
    assert_eq!(stored.progress, 40);
    assert_eq!(stored.errors.len(), 1);
    assert_eq!(stored.errors[0].external_id.as_deref(), Some("p-3"));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_record_progress_for_unknown_task_fails() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let update = ProgressUpdate {
        metrics: TaskMetrics::default(),
        errors: vec![],
        percentage: 0,
    };

    let result = tasks.record_progress(Uuid::new_v4(), &update).await;

    assert!(matches!(result, Err(AppError::TaskNotFound(_))));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_pending_task_is_immediate() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();

    let status = tasks.request_cancel(task.id).await.unwrap();

    assert_eq!(status, TaskStatus::Cancelled);
    assert!(tasks.is_cancel_requested(task.id).await.unwrap());
    let stored = tasks.get_task(task.id).await.unwrap().unwrap();
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_processing_task_sets_flag_only() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();
    tasks.mark_processing(task.id).await.unwrap();

    let status = tasks.request_cancel(task.id).await.unwrap();

    assert_eq!(status, TaskStatus::Processing);
    assert!(tasks.is_cancel_requested(task.id).await.unwrap());

    let cancelled = tasks
        .finish_task(task.id, TaskStatus::Cancelled, None)
        .await
        .unwrap();
    assert!(cancelled);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_finished_task_is_noop() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();
    tasks.mark_processing(task.id).await.unwrap();
    tasks
        .finish_task(task.id, TaskStatus::Completed, None)
        .await
        .unwrap();

    let status = tasks.request_cancel(task.id).await.unwrap();

    assert_eq!(status, TaskStatus::Completed);
    assert!(!tasks.is_cancel_requested(task.id).await.unwrap());
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_cancel_unknown_task_is_not_found() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);

    let result = tasks.request_cancel(Uuid::new_v4()).await;

    assert!(matches!(result, Err(AppError::TaskNotFound(_))));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_upserts_are_idempotent() {
    // Arrange
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1", "g2"]), 3).await.unwrap();

    let groups = vec![group("g2"), group("g1")];
    let posts = vec![post("p1", "g1", "first"), post("p2", "g1", "second")];
    let comments = vec![comment("c1", "p1"), comment("c2", "p1"), comment("c1", "p1")];

    // Act: the same batches twice, as a re-executed job would
    for _ in 0..2 {
        tasks.upsert_groups(task.id, &groups).await.unwrap();
        tasks.upsert_posts(task.id, &posts).await.unwrap();
        tasks.upsert_comments(task.id, &comments).await.unwrap();
    }
    let edited = vec![post("p1", "g1", "edited")];
    tasks.upsert_posts(task.id, &edited).await.unwrap();

    // Assert
    let counts = tasks.count_records(task.id).await.unwrap();
    assert_eq!(counts.groups, 2);
    assert_eq!(counts.posts, 2);
    assert_eq!(counts.comments, 2);

    let stored = tasks.list_groups(task.id).await.unwrap();
    let ids: Vec<&str> = stored.iter().map(|g| g.external_id.as_str()).collect();
    assert_eq!(ids, vec!["g1", "g2"]);
    assert_eq!(stored[0].member_count, Some(42));
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_records_are_scoped_per_task() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (first, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();
    let (second, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();

    tasks.upsert_groups(first.id, &[group("g1")]).await.unwrap();
    tasks.upsert_groups(second.id, &[group("g1")]).await.unwrap();

    assert_eq!(tasks.count_records(first.id).await.unwrap().groups, 1);
    assert_eq!(tasks.count_records(second.id).await.unwrap().groups, 1);
}

#[tokio::test]
#[ignore = "requires Docker"]
async fn test_empty_batch_writes_nothing() {
    let (pool, _container) = setup_test_db().await;
    let tasks = TaskRepository::new(pool);
    let (task, _) = tasks.create_task(new_task(&["g1"]), 3).await.unwrap();

    let written = tasks.upsert_posts(task.id, &[]).await.unwrap();

    assert_eq!(written, 0);
}
