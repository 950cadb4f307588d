//! Outcome types of one pipeline execution.

use crate::progress::Phase;

/// Outcome of processing a single item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Fetched and persisted.
    Collected,
    /// Recorded as an item error and skipped.
    Failed,
}

/// Statistics for one execution of a task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CollectionStats {
    pub groups: usize,
    pub posts: usize,
    pub comments: usize,
    pub failed: usize,
}

impl CollectionStats {
    /// Creates a new empty stats tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an outcome, incrementing the appropriate counter.
    pub fn record(&mut self, phase: Phase, outcome: ItemOutcome) {
        self.record_many(phase, outcome, 1);
    }

    pub fn record_many(&mut self, phase: Phase, outcome: ItemOutcome, count: usize) {
        match (outcome, phase) {
            (ItemOutcome::Failed, _) => self.failed += count,
            (ItemOutcome::Collected, Phase::Groups) => self.groups += count,
            (ItemOutcome::Collected, Phase::Posts) => self.posts += count,
            (ItemOutcome::Collected, Phase::Comments) => self.comments += count,
        }
    }

    /// Returns the number of collected records.
    pub fn collected(&self) -> usize {
        self.groups + self.posts + self.comments
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectionStatus {
    /// Every phase exhausted its inputs.
    Completed,
    /// The task's cancel flag was observed at a batch boundary.
    Cancelled,
    /// The worker is shutting down; the job goes back to the queue.
    Interrupted,
}

/// Result of a pipeline execution.
#[derive(Debug, Clone)]
pub struct CollectionResult {
    pub status: CollectionStatus,
    pub stats: CollectionStats,
}

impl CollectionResult {
    pub fn completed(stats: CollectionStats) -> Self {
        Self {
            status: CollectionStatus::Completed,
            stats,
        }
    }

    pub fn cancelled(stats: CollectionStats) -> Self {
        Self {
            status: CollectionStatus::Cancelled,
            stats,
        }
    }

    pub fn interrupted(stats: CollectionStats) -> Self {
        Self {
            status: CollectionStatus::Interrupted,
            stats,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CollectionStatus::Completed
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == CollectionStatus::Cancelled
    }
}
