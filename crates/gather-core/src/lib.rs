//! Gather Core - Domain types, collection pipeline, job queue and progress.
//!
//! This crate provides the core functionality for Gather, including:
//!
//! - **Domain models**: [`Task`], [`Job`], [`Group`], [`Post`], [`Comment`]
//! - **Progress**: [`ProgressCalculator`] folds three partially known counters
//!   into one 0–100 percentage
//! - **Services**: [`CollectionService`] walks groups → posts → comments,
//!   [`WorkerService`]/[`WorkerPool`] drain the job queue, [`TaskService`]
//!   submits and inspects tasks
//! - **Traits**: [`PlatformClient`], [`TaskStore`], [`ResultStore`], [`JobQueue`]
//!   for dependency injection
//! - **Reporting**: [`ProgressReporter`] and [`WorkerReporter`] for decoupled logging
//!
//! # Architecture
//!
//! This crate is designed to be reusable by different frontends (CLI, server)
//! and depends on no web framework. I/O sits behind traits:
//!
//! - [`PlatformClient`] - the external platform API (e.g., `gather-client`)
//! - [`TaskStore`], [`ResultStore`], [`JobQueue`] - persistence (e.g., `gather-db`,
//!   or the embedded [`MemoryBackend`])
//!
//! # Example
//!
//! ```ignore
//! use gather_core::{CollectionService, MemoryBackend, TaskOptions, TaskService};
//!
//! let backend = MemoryBackend::default();
//! let tasks = TaskService::new(backend.clone(), backend.clone(), backend.clone());
//! let task = tasks.submit(["123", "456"], TaskOptions::default()).await?;
//!
//! let collector = CollectionService::new(backend.clone(), backend.clone(), client);
//! let result = collector.collect_task(&task).await?;
//! println!("{} records", result.stats.collected());
//! ```

pub mod collector;
pub mod config;
pub mod error;
pub mod job;
pub mod job_queue;
pub mod memory;
pub mod models;
pub mod progress;
pub mod rate_limit;
pub mod reporter;
pub mod retry;
pub mod service;
pub mod stats;
pub mod task;
pub mod traits;
pub mod worker;

// Configuration
pub use config::{CollectConfig, DbConfig, HttpConfig, env_or};

// Error handling
pub use error::{AppError, FailureKind};

// Domain models
pub use models::{Comment, Group, Page, Post};
pub use task::{
    ErrorScope, NewTask, Task, TaskError, TaskMetrics, TaskOptions, TaskStatus, dedup_group_ids,
};

// Progress calculation
pub use progress::{
    EstimateBounds, Phase, PhaseProgress, PhaseWeights, ProgressCalculator, ProgressConfig,
    ProgressSnapshot, calculate, estimate_total, validate_metrics,
};

// Retry and rate limiting
pub use rate_limit::{RateLimitConfig, RateLimitMode, RateLimitedClient};
pub use retry::{RetryFailure, RetryPolicy};

// Progress reporting
pub use reporter::{CollectionEvent, ProgressReporter, SilentReporter, TracingReporter};
pub use stats::{CollectionResult, CollectionStats, CollectionStatus, ItemOutcome};

// Traits for dependency injection
pub use traits::{PlatformClient, ProgressUpdate, RecordCounts, ResultStore, TaskStore};

// Services (generic over trait implementations)
pub use collector::CollectionService;
pub use service::{ProgressView, StartNowOutcome, TaskService, TaskStatusView};

// Job queue types
pub use job::{
    BackoffConfig, BackoffMode, CollectTaskPayload, Job, JobPayload, JobState, JobTransition,
    QueueConfig, WorkerConfig,
};
pub use job_queue::{FailOutcome, JobQueue, ReapOutcome};
pub use memory::MemoryBackend;

// Worker service
pub use worker::{
    JobOutcome, SilentWorkerReporter, TracingWorkerReporter, WorkerEvent, WorkerPool,
    WorkerReporter, WorkerService,
};
