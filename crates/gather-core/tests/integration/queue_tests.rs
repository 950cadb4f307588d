//! Delivery order, exclusivity and bookkeeping of the embedded job queue.

use std::collections::HashSet;
use std::time::Duration;

use gather_core::job_queue::JobQueue;
use gather_core::{JobPayload, JobState, StartNowOutcome, TaskOptions};
use uuid::Uuid;

use super::common::{backend, submit, task_service};

/// Submits one task per group id, a few milliseconds apart so that
/// `created_at` orders them.
async fn submit_in_order(backend: &gather_core::MemoryBackend, ids: &[&str]) -> Vec<Uuid> {
    let mut task_ids = Vec::new();
    for id in ids {
        task_ids.push(submit(backend, &[id], TaskOptions::default()).await);
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    task_ids
}

#[tokio::test]
async fn test_jobs_are_delivered_oldest_first() {
    // Arrange
    let backend = backend();
    let task_ids = submit_in_order(&backend, &["a", "b", "c"]).await;

    // Act
    let mut delivered = Vec::new();
    while let Some(job) = backend.dequeue("w").await.unwrap() {
        delivered.push(job.task_id);
    }

    // Assert
    assert_eq!(delivered, task_ids);
}

#[tokio::test]
async fn test_prioritized_job_jumps_the_queue() {
    // Arrange
    let backend = backend();
    let task_ids = submit_in_order(&backend, &["a", "b", "c"]).await;
    let service = task_service(&backend);

    // Act
    let outcome = service.start_now(task_ids[2]).await.unwrap();

    // Assert
    let StartNowOutcome::Prioritized(job) = outcome else {
        panic!("expected the waiting job to be prioritized, got {:?}", outcome);
    };
    assert!(job.priority > 0);
    let first = backend.dequeue("w").await.unwrap().unwrap();
    assert_eq!(first.task_id, task_ids[2]);
    let second = backend.dequeue("w").await.unwrap().unwrap();
    assert_eq!(second.task_id, task_ids[0]);
}

#[tokio::test]
async fn test_start_now_on_active_job_reports_running() {
    let backend = backend();
    let task_id = submit(&backend, &["a"], TaskOptions::default()).await;
    backend.dequeue("w").await.unwrap().unwrap();

    let outcome = task_service(&backend).start_now(task_id).await.unwrap();

    assert!(matches!(outcome, StartNowOutcome::AlreadyRunning(_)));
}

#[tokio::test]
async fn test_concurrent_workers_never_share_a_job() {
    // Arrange
    let backend = backend();
    let ids: Vec<String> = (0..20).map(|n| n.to_string()).collect();
    for id in &ids {
        submit(&backend, &[id.as_str()], TaskOptions::default()).await;
    }

    // Act
    let mut handles = Vec::new();
    for worker in 0..4 {
        let backend = backend.clone();
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w-{}", worker);
            let mut claimed = Vec::new();
            while let Some(job) = backend.dequeue(&worker_id).await.unwrap() {
                assert_eq!(job.worker_id.as_deref(), Some(worker_id.as_str()));
                claimed.push(job.id);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }
    let mut all = Vec::new();
    for handle in handles {
        all.extend(handle.await.unwrap());
    }

    // Assert
    let unique: HashSet<_> = all.iter().collect();
    assert_eq!(all.len(), 20);
    assert_eq!(unique.len(), 20);
    assert_eq!(backend.count_by_state(JobState::Active).await.unwrap(), 20);
    assert_eq!(backend.count_by_state(JobState::Waiting).await.unwrap(), 0);
}

#[tokio::test]
async fn test_delivery_stamps_payload_attempt() {
    let backend = backend();
    let task_id = submit(&backend, &["a"], TaskOptions::default()).await;

    let job = backend.dequeue("w").await.unwrap().unwrap();

    let JobPayload::CollectTaskV1(payload) = &job.payload;
    assert_eq!(payload.task_id, task_id);
    assert_eq!(payload.attempt, 1);

    let json = serde_json::to_value(&job.payload).unwrap();
    assert_eq!(json["kind"], "collect_task.v1");
    assert_eq!(json["attempt"], 1);
}

#[tokio::test]
async fn test_list_and_count_by_state() {
    // Arrange
    let backend = backend();
    submit_in_order(&backend, &["a", "b", "c"]).await;
    let first = backend.dequeue("w").await.unwrap().unwrap();
    assert!(backend.ack(first.id, "w").await.unwrap());
    let second = backend.dequeue("w").await.unwrap().unwrap();
    backend.fail(second.id, "w", false, "boom").await.unwrap();

    // Act
    let waiting = task_service(&backend)
        .list_jobs(JobState::Waiting, 10)
        .await
        .unwrap();
    let dead = backend.list_by_state(JobState::Dead, 10).await.unwrap();

    // Assert
    assert_eq!(waiting.len(), 1);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].last_error.as_deref(), Some("boom"));
    assert_eq!(backend.count_by_state(JobState::Completed).await.unwrap(), 1);
    assert_eq!(backend.count_by_state(JobState::Active).await.unwrap(), 0);
}

#[tokio::test]
async fn test_list_respects_limit() {
    let backend = backend();
    submit_in_order(&backend, &["a", "b", "c"]).await;

    let jobs = backend.list_by_state(JobState::Waiting, 2).await.unwrap();

    assert_eq!(jobs.len(), 2);
    assert!(jobs[0].created_at <= jobs[1].created_at);
}
