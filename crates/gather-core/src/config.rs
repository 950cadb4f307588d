//! Configuration types for Gather components.
//!
//! Every struct has sensible defaults and a `from_env` constructor reading
//! `GATHER_*` variables on top of them. Binaries layer clap arguments over
//! the result.

use std::str::FromStr;
use std::time::Duration;

use crate::error::AppError;
use crate::progress::{DEFAULT_AVG_POSTS_PER_GROUP, DEFAULT_ESTIMATE_FLOOR, ProgressConfig};
use crate::retry::RetryPolicy;

/// Reads `name` from the environment, falling back to `default` when unset.
///
/// A set but unparsable value is a configuration error, not a silent default.
pub fn env_or<T>(name: &str, default: T) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| AppError::ConfigError(format!("{}={:?}: {}", name, raw, e))),
        Err(_) => Ok(default),
    }
}

// =============================================================================
// Database
// =============================================================================

/// Database connection pool configuration.
#[derive(Debug, Clone)]
pub struct DbConfig {
    pub max_connections: u32,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self { max_connections: 5 }
    }
}

impl DbConfig {
    /// Reads `GATHER_DB_MAX_CONNECTIONS`.
    pub fn from_env() -> Result<Self, AppError> {
        let default = Self::default();
        Ok(Self {
            max_connections: env_or("GATHER_DB_MAX_CONNECTIONS", default.max_connections)?,
        })
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// HTTP client configuration for the platform API.
#[derive(Debug, Clone)]
pub struct HttpConfig {
    pub timeout: Duration,
    /// Items requested per page.
    pub page_size: u32,
    pub user_agent: String,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            page_size: 100,
            user_agent: concat!("gather/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl HttpConfig {
    /// Reads `GATHER_HTTP_TIMEOUT_SECS` and `GATHER_PAGE_SIZE`.
    pub fn from_env() -> Result<Self, AppError> {
        let default = Self::default();
        Ok(Self {
            timeout: Duration::from_secs(env_or(
                "GATHER_HTTP_TIMEOUT_SECS",
                default.timeout.as_secs(),
            )?),
            page_size: env_or("GATHER_PAGE_SIZE", default.page_size)?.max(1),
            user_agent: default.user_agent,
        })
    }
}

// =============================================================================
// Collection pipeline
// =============================================================================

/// Collection pipeline configuration.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    /// Groups resolved per batch.
    pub group_batch_size: usize,
    /// Concurrent platform calls within a batch.
    pub concurrency: usize,
    /// Per-call retry of transient failures.
    pub retry: RetryPolicy,
    pub progress: ProgressConfig,
}

impl Default for CollectConfig {
    fn default() -> Self {
        Self {
            group_batch_size: 10,
            concurrency: 4,
            retry: RetryPolicy::default(),
            progress: ProgressConfig::default(),
        }
    }
}

impl CollectConfig {
    /// Reads `GATHER_GROUP_BATCH_SIZE`, `GATHER_CONCURRENCY`,
    /// `GATHER_ITEM_MAX_ATTEMPTS`, `GATHER_AVG_POSTS_PER_GROUP` and
    /// `GATHER_ESTIMATE_FLOOR`.
    pub fn from_env() -> Result<Self, AppError> {
        let default = Self::default();
        let retry = default
            .retry
            .clone()
            .with_max_attempts(env_or("GATHER_ITEM_MAX_ATTEMPTS", default.retry.max_attempts)?);
        let progress = default
            .progress
            .clone()
            .with_avg_posts_per_group(env_or(
                "GATHER_AVG_POSTS_PER_GROUP",
                DEFAULT_AVG_POSTS_PER_GROUP,
            )?)
            .with_estimate_floor(env_or("GATHER_ESTIMATE_FLOOR", DEFAULT_ESTIMATE_FLOOR)?);

        Ok(Self {
            group_batch_size: env_or("GATHER_GROUP_BATCH_SIZE", default.group_batch_size)?.max(1),
            concurrency: env_or("GATHER_CONCURRENCY", default.concurrency)?.max(1),
            retry,
            progress,
        })
    }

    pub fn with_group_batch_size(mut self, size: usize) -> Self {
        self.group_batch_size = size.max(1);
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_progress(mut self, progress: ProgressConfig) -> Self {
        self.progress = progress;
        self
    }
}
