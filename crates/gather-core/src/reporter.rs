//! Progress reporting for the collection pipeline.
//!
//! The pipeline emits [`CollectionEvent`]s; a [`ProgressReporter`] decides
//! what to do with them. Server and CLI log them through
//! [`TracingReporter`], tests and library users can stay silent.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::progress::{Phase, ProgressSnapshot};
use crate::stats::CollectionStats;
use crate::task::TaskError;

/// Events emitted while a task is collected.
#[derive(Debug, Clone)]
pub enum CollectionEvent<'a> {
    /// The pipeline picked the task up.
    Started { task_id: Uuid, groups: usize },
    /// A phase began.
    PhaseStarted { task_id: Uuid, phase: Phase },
    /// A batch was persisted and metrics pushed.
    BatchPersisted {
        task_id: Uuid,
        phase: Phase,
        snapshot: &'a ProgressSnapshot,
    },
    /// An item failed and was recorded on the task.
    ItemFailed { task_id: Uuid, error: &'a TaskError },
    /// A phase exhausted its inputs.
    PhaseCompleted { task_id: Uuid, phase: Phase },
    /// The pipeline saw the cancel flag and stopped.
    Cancelled {
        task_id: Uuid,
        stats: &'a CollectionStats,
    },
    /// Every phase finished.
    Completed {
        task_id: Uuid,
        stats: &'a CollectionStats,
    },
}

/// Trait for reporting pipeline events.
pub trait ProgressReporter: Send + Sync {
    /// Called when a pipeline event occurs.
    ///
    /// The default implementation does nothing (silent mode).
    fn report(&self, event: CollectionEvent<'_>) {
        let _ = event;
    }
}

/// Silent reporter that ignores all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}

/// Tracing-based reporter for CLI/server logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ProgressReporter for TracingReporter {
    fn report(&self, event: CollectionEvent<'_>) {
        match event {
            CollectionEvent::Started { task_id, groups } => {
                info!(%task_id, groups, "Collection started");
            }
            CollectionEvent::PhaseStarted { task_id, phase } => {
                info!(%task_id, %phase, "Phase started");
            }
            CollectionEvent::BatchPersisted {
                task_id,
                phase,
                snapshot,
            } => {
                debug!(
                    %task_id,
                    %phase,
                    percentage = snapshot.percentage,
                    "Batch persisted"
                );
            }
            CollectionEvent::ItemFailed { task_id, error } => {
                warn!(
                    %task_id,
                    scope = error.scope.as_str(),
                    external_id = error.external_id.as_deref().unwrap_or("-"),
                    error = %error.message,
                    "Item failed"
                );
            }
            CollectionEvent::PhaseCompleted { task_id, phase } => {
                info!(%task_id, %phase, "Phase completed");
            }
            CollectionEvent::Cancelled { task_id, stats } => {
                info!(%task_id, collected = stats.collected(), "Collection cancelled");
            }
            CollectionEvent::Completed { task_id, stats } => {
                info!(
                    %task_id,
                    groups = stats.groups,
                    posts = stats.posts,
                    comments = stats.comments,
                    failed = stats.failed,
                    "Collection completed"
                );
            }
        }
    }
}
