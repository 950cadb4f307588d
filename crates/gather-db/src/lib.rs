//! Gather DB - PostgreSQL persistence for tasks, jobs and collected records
//!
//! This crate implements the storage traits of `gather-core` on top of
//! `sqlx` and PostgreSQL.
//!
//! # Overview
//!
//! The main components are:
//! - [`TaskRepository`] - Task state ([`TaskStore`]) and collected records ([`ResultStore`])
//! - [`JobRepository`] - Persistent job queue ([`JobQueue`]) using `FOR UPDATE SKIP LOCKED`
//! - [`MIGRATOR`] - Embedded schema migrations
//!
//! [`TaskStore`]: gather_core::TaskStore
//! [`ResultStore`]: gather_core::ResultStore
//! [`JobQueue`]: gather_core::JobQueue

mod job_repository;
mod task_repository;

use gather_core::DbConfig;
use gather_core::error::AppError;
use sqlx::PgPool;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;

pub use job_repository::JobRepository;
pub use task_repository::TaskRepository;

/// Migrations under `crates/gather-db/migrations`, embedded at compile time.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Opens a connection pool.
///
/// # Errors
///
/// Returns `AppError::StoreUnavailable` if the database cannot be reached.
pub async fn connect(database_url: &str, config: &DbConfig) -> Result<PgPool, AppError> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .connect(database_url)
        .await
        .map_err(store_error)
}

/// Applies pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<(), AppError> {
    MIGRATOR
        .run(pool)
        .await
        .map_err(|e| AppError::StoreUnavailable(format!("migration failed: {}", e)))
}

/// Round-trips a trivial query, for health checks.
pub async fn ping(pool: &PgPool) -> Result<(), AppError> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .map_err(store_error)?;
    Ok(())
}

/// Maps connectivity failures to `StoreUnavailable`; everything else stays a
/// `DatabaseError`.
pub(crate) fn store_error(e: sqlx::Error) -> AppError {
    match e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => AppError::StoreUnavailable(e.to_string()),
        other => AppError::DatabaseError(other),
    }
}
