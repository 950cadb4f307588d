//! Integration tests for the collection pipeline.

use std::sync::{Arc, Mutex};

use gather_core::traits::{ResultStore, TaskStore};
use gather_core::{
    AppError, CollectionEvent, ErrorScope, Phase, ProgressReporter, SilentReporter, TaskOptions,
};
use tokio_util::sync::CancellationToken;

use super::common::{Failure, ScriptedClient, backend, collector, submit, task_service};

/// Reporter that records a short label per event.
#[derive(Clone, Default)]
struct RecordingReporter {
    events: Arc<Mutex<Vec<String>>>,
}

impl RecordingReporter {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, event: CollectionEvent<'_>) {
        let label = match event {
            CollectionEvent::Started { .. } => "started".to_string(),
            CollectionEvent::PhaseStarted { phase, .. } => format!("start:{}", phase),
            CollectionEvent::BatchPersisted { phase, .. } => format!("batch:{}", phase),
            CollectionEvent::ItemFailed { error, .. } => format!("failed:{}", error.scope.as_str()),
            CollectionEvent::PhaseCompleted { phase, .. } => format!("done:{}", phase),
            CollectionEvent::Cancelled { .. } => "cancelled".to_string(),
            CollectionEvent::Completed { .. } => "completed".to_string(),
        };
        self.events.lock().unwrap().push(label);
    }
}

#[tokio::test]
async fn test_full_hierarchy_is_collected() {
    // Arrange
    let backend = backend();
    let client = ScriptedClient::new()
        .with_group("1", 3, 2)
        .with_group("2", 3, 2);
    let task_id = submit(&backend, &["1", "2"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    // Act
    let result = collector(&backend, client).collect_task(&task).await.unwrap();

    // Assert
    assert!(result.is_completed());
    assert_eq!(result.stats.groups, 2);
    assert_eq!(result.stats.posts, 6);
    assert_eq!(result.stats.comments, 12);
    assert_eq!(result.stats.failed, 0);

    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.metrics.groups_processed, 2);
    assert_eq!(stored.metrics.posts_total, 6);
    assert_eq!(stored.metrics.posts_processed, 6);
    assert_eq!(stored.metrics.comments_total, 12);
    assert_eq!(stored.metrics.comments_processed, 12);
    assert!(stored.metrics.posts_total_exact);
    assert!(stored.metrics.comments_total_exact);
    assert_eq!(stored.progress, 100);
    assert!(stored.errors.is_empty());

    let counts = backend.count_records(task_id).await.unwrap();
    assert_eq!((counts.groups, counts.posts, counts.comments), (2, 6, 12));
}

#[tokio::test]
async fn test_status_view_after_completion() {
    let backend = backend();
    let client = ScriptedClient::new().with_group("1", 1, 1);
    let task_id = submit(&backend, &["1"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();
    collector(&backend, client).collect_task(&task).await.unwrap();
    backend
        .finish_task(task_id, gather_core::TaskStatus::Completed, None)
        .await
        .unwrap();

    let view = task_service(&backend).get_status(task_id).await.unwrap();

    assert_eq!(view.progress.percentage, 100);
    assert_eq!(view.phase, Phase::Comments);
    assert!(view.phases.iter().all(|p| p.completed));
    assert_eq!(view.groups.len(), 1);
    assert_eq!(view.groups[0].name, "Group 1");
    assert!(view.finished_at.is_some());
}

#[tokio::test]
async fn test_missing_group_is_recorded_and_skipped() {
    // Arrange
    let backend = backend();
    let client = ScriptedClient::new();
    let task_id = submit(&backend, &["missing"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    // Act
    let result = collector(&backend, client).collect_task(&task).await.unwrap();

    // Assert
    assert!(result.is_completed());
    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.errors.len(), 1);
    assert_eq!(stored.errors[0].scope, ErrorScope::Group);
    assert_eq!(stored.errors[0].external_id.as_deref(), Some("missing"));
    assert_eq!(stored.metrics.groups_processed, 0);
    assert_eq!(stored.progress, 100);
}

#[tokio::test]
async fn test_transient_failures_are_retried_without_duplicates() {
    // Arrange
    let backend = backend();
    let client = ScriptedClient::new()
        .with_group("1", 2, 1)
        .with_failure("group:1", Failure::Transient(2))
        .with_failure("comments:1-p0", Failure::Transient(1));
    let task_id = submit(&backend, &["1"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    // Act
    let result = collector(&backend, client.clone())
        .collect_task(&task)
        .await
        .unwrap();

    // Assert
    assert!(result.is_completed());
    assert_eq!(client.calls("group:1"), 3);
    assert_eq!(client.calls("comments:1-p0"), 2);

    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    assert!(stored.errors.is_empty());
    let counts = backend.count_records(task_id).await.unwrap();
    assert_eq!((counts.groups, counts.posts, counts.comments), (1, 2, 2));
}

#[tokio::test]
async fn test_exhausted_retries_become_item_errors() {
    let backend = backend();
    let client = ScriptedClient::new()
        .with_group("1", 1, 0)
        .with_group("2", 1, 0)
        .with_failure("group:1", Failure::Transient(10));
    let task_id = submit(&backend, &["1", "2"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    let result = collector(&backend, client.clone())
        .collect_task(&task)
        .await
        .unwrap();

    assert!(result.is_completed());
    assert_eq!(client.calls("group:1"), 3);
    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.errors.len(), 1);
    assert!(stored.errors[0].message.contains("gave up after 3 attempts"));
    assert_eq!(stored.metrics.groups_processed, 1);
}

#[tokio::test]
async fn test_failed_post_page_stops_only_that_group() {
    let backend = backend();
    let client = ScriptedClient::new()
        .with_group("1", 2, 1)
        .with_group("2", 2, 1)
        .with_failure("posts:1", Failure::NotFound);
    let task_id = submit(&backend, &["1", "2"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    let result = collector(&backend, client).collect_task(&task).await.unwrap();

    assert!(result.is_completed());
    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.errors.len(), 1);
    assert_eq!(stored.errors[0].scope, ErrorScope::Group);
    assert!(stored.errors[0].message.starts_with("posts:"));
    let posts = backend.posts_of(task_id).unwrap();
    assert_eq!(posts.len(), 2);
    assert!(posts.iter().all(|p| p.group_id == "2"));
}

#[tokio::test]
async fn test_fatal_error_aborts_collection() {
    let backend = backend();
    let client = ScriptedClient::new()
        .with_group("1", 1, 1)
        .with_group("2", 1, 1)
        .with_failure("group:2", Failure::Unauthorized);
    let task_id = submit(&backend, &["1", "2"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    let err = collector(&backend, client.clone())
        .collect_task(&task)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::Unauthorized(_)));
    assert!(err.is_fatal());
    // Fatal errors are not retried.
    assert_eq!(client.calls("group:2"), 1);
    assert_eq!(client.calls("posts:1"), 0);
}

#[tokio::test]
async fn test_max_comments_stops_comment_phase() {
    // Arrange
    let backend = backend();
    let client = ScriptedClient::new().with_group("1", 4, 5);
    let options = TaskOptions {
        max_comments: Some(3),
        ..TaskOptions::default()
    };
    let task_id = submit(&backend, &["1"], options).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    // Act
    let result = collector(&backend, client.clone())
        .collect_task(&task)
        .await
        .unwrap();

    // Assert
    assert!(result.is_completed());
    assert_eq!(result.stats.comments, 3);
    assert_eq!(backend.comments_of(task_id).unwrap().len(), 3);
    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(stored.metrics.comments_processed, 3);
    assert_eq!(stored.metrics.comments_total, 3);
    assert!(stored.metrics.comments_total_exact);
    // The last two posts were never asked for comments.
    assert_eq!(client.calls("comments:1-p3"), 0);
}

#[tokio::test]
async fn test_unreported_totals_still_reach_completion() {
    let backend = backend();
    let client = ScriptedClient::new()
        .without_totals()
        .with_group("1", 3, 0)
        .with_group("2", 0, 0);
    let task_id = submit(&backend, &["1", "2"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();

    let result = collector(&backend, client).collect_task(&task).await.unwrap();

    assert!(result.is_completed());
    let stored = backend.get_task(task_id).await.unwrap().unwrap();
    // Comment counts are still reported per post (all zero), totals come from processed.
    assert_eq!(stored.metrics.posts_total, 3);
    assert_eq!(stored.progress, 100);
}

#[tokio::test]
async fn test_re_execution_counts_nothing_twice() {
    // Arrange
    let backend = backend();
    let client = ScriptedClient::new()
        .with_group("1", 3, 2)
        .with_failure("group:gone", Failure::NotFound);
    let task_id = submit(&backend, &["1", "gone"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();
    let service = collector(&backend, client);
    service.collect_task(&task).await.unwrap();
    let first = backend.get_task(task_id).await.unwrap().unwrap();

    // Act
    let task = backend.mark_processing(task_id).await.unwrap();
    service.collect_task(&task).await.unwrap();

    // Assert
    let second = backend.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(second.metrics, first.metrics);
    assert_eq!(second.errors.len(), 1);
    let counts = backend.count_records(task_id).await.unwrap();
    assert_eq!((counts.groups, counts.posts, counts.comments), (1, 3, 6));
}

#[tokio::test]
async fn test_events_follow_phase_order() {
    let backend = backend();
    let client = ScriptedClient::new().with_group("1", 1, 1);
    let task_id = submit(&backend, &["1", "404"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();
    let reporter = RecordingReporter::default();

    collector(&backend, client)
        .collect(&task, &CancellationToken::new(), &reporter)
        .await
        .unwrap();

    let events = reporter.events();
    let position = |label: &str| events.iter().position(|e| e == label).unwrap();
    assert_eq!(events.first().map(String::as_str), Some("started"));
    assert_eq!(events.last().map(String::as_str), Some("completed"));
    assert!(position("start:groups") < position("failed:group"));
    assert!(position("done:groups") < position("start:posts"));
    assert!(position("done:posts") < position("start:comments"));
    assert!(events.iter().any(|e| e == "batch:comments"));
}

#[tokio::test]
async fn test_store_outage_aborts_with_retryable_error() {
    let backend = backend();
    let client = ScriptedClient::new().with_group("1", 1, 1);
    let task_id = submit(&backend, &["1"], TaskOptions::default()).await;
    let task = backend.mark_processing(task_id).await.unwrap();
    backend.set_available(false);

    let err = collector(&backend, client)
        .collect(&task, &CancellationToken::new(), &SilentReporter)
        .await
        .unwrap_err();

    assert!(matches!(err, AppError::StoreUnavailable(_)));
    assert!(err.is_retryable());
}
