use thiserror::Error;
use uuid::Uuid;

/// How a failure should be handled by the collection pipeline.
///
/// Classification drives three different reactions:
/// - `Transient` failures are retried with backoff a bounded number of times.
/// - `Permanent` failures are recorded against the item and skipped.
/// - `Fatal` failures abort the whole task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network blips, timeouts, rate limits, upstream 5xx, store unavailable.
    Transient,
    /// Resource not found, access forbidden, malformed id or payload.
    Permanent,
    /// Invalid credentials or anything that makes further calls pointless.
    Fatal,
}

/// Application-wide error types.
///
/// This enum represents all possible errors that can occur in Gather.
/// It uses the `thiserror` crate for ergonomic error handling and automatic
/// conversion from underlying library errors.
///
/// # Error Conversion
///
/// - `sqlx::Error` → `AppError::DatabaseError`
/// - `serde_json::Error` → `AppError::SerializationError`
///
/// # Examples
///
/// ```no_run
/// use gather_core::error::AppError;
///
/// fn example() -> Result<(), AppError> {
///     Err(AppError::Generic("Something went wrong".to_string()))
/// }
/// ```
#[derive(Error, Debug)]
pub enum AppError {
    /// Database operation failed.
    ///
    /// Wraps all errors from SQLx database operations, including
    /// connection failures, query errors, and constraint violations.
    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),

    /// The external API answered with something we cannot use.
    #[error("API Client error: {0}")]
    ClientError(String),

    /// JSON serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Network or connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Request timeout.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Rate limit exceeded, either locally or reported by the upstream API.
    #[error("Rate limit exceeded. Please wait and try again.")]
    RateLimitExceeded,

    /// Upstream server error (5xx).
    #[error("Upstream server error (HTTP {0})")]
    ServerError(u16),

    /// The external resource (group, post) does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The external resource exists but cannot be read with our credentials.
    #[error("Access forbidden: {0}")]
    Forbidden(String),

    /// Malformed external identifier.
    #[error("Invalid identifier: {0}")]
    InvalidId(String),

    /// Credentials were rejected by the external API.
    ///
    /// Every further call would fail the same way, so this aborts the task.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Task does not exist.
    #[error("Task not found: {0}")]
    TaskNotFound(Uuid),

    /// Job does not exist.
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    /// A state transition was requested that the state machine forbids.
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    /// Caller supplied input that cannot be accepted.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The queue or task store backend cannot be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic application error for cases not covered by specific variants.
    ///
    /// Use this sparingly - prefer creating specific error variants
    /// for better error handling and debugging.
    #[error("Error: {0}")]
    Generic(String),
}

impl AppError {
    /// Returns a user-friendly error message suitable for CLI output.
    pub fn user_message(&self) -> String {
        match self {
            AppError::DatabaseError(e) => {
                if e.to_string().contains("connection") {
                    "Cannot connect to database. Is PostgreSQL running?\n   Try: docker-compose up -d".to_string()
                } else {
                    format!("Database error: {}", e)
                }
            }
            AppError::Unauthorized(_) => {
                "The platform rejected our credentials.\n   Check your PLATFORM_ACCESS_TOKEN environment variable.".to_string()
            }
            AppError::NetworkError(msg) => {
                format!("Network error: {}\n   Check your internet connection.", msg)
            }
            AppError::Timeout(secs) => {
                format!("Request timed out after {} seconds.\n   The platform may be overloaded. Try again later.", secs)
            }
            AppError::RateLimitExceeded => {
                "Too many requests. Please wait a moment and try again.".to_string()
            }
            AppError::StoreUnavailable(msg) => {
                format!("The task store is unavailable: {}\n   The request can be retried.", msg)
            }
            AppError::TaskNotFound(id) => format!("No task with id {}", id),
            AppError::ConfigError(msg) => {
                format!("Configuration error: {}\n   Check your environment variables.", msg)
            }
            _ => self.to_string(),
        }
    }

    /// Classifies the error for the collection pipeline.
    ///
    /// # Examples
    ///
    /// ```
    /// use gather_core::error::{AppError, FailureKind};
    ///
    /// assert_eq!(AppError::ServerError(502).failure_kind(), FailureKind::Transient);
    /// assert_eq!(AppError::NotFound("g1".into()).failure_kind(), FailureKind::Permanent);
    /// assert_eq!(AppError::Unauthorized("bad token".into()).failure_kind(), FailureKind::Fatal);
    /// ```
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AppError::NetworkError(_)
            | AppError::Timeout(_)
            | AppError::RateLimitExceeded
            | AppError::ServerError(_)
            | AppError::StoreUnavailable(_) => FailureKind::Transient,

            AppError::DatabaseError(e) if is_transient_sqlx(e) => FailureKind::Transient,

            AppError::Unauthorized(_) | AppError::ConfigError(_) => FailureKind::Fatal,

            AppError::ClientError(_)
            | AppError::DatabaseError(_)
            | AppError::SerializationError(_)
            | AppError::NotFound(_)
            | AppError::Forbidden(_)
            | AppError::InvalidId(_)
            | AppError::TaskNotFound(_)
            | AppError::JobNotFound(_)
            | AppError::InvalidTransition { .. }
            | AppError::InvalidInput(_)
            | AppError::Generic(_) => FailureKind::Permanent,
        }
    }

    /// Returns true if this error is retryable.
    ///
    /// # Examples
    ///
    /// ```
    /// use gather_core::error::AppError;
    ///
    /// let err = AppError::NetworkError("connection reset".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::StoreUnavailable("queue down".to_string());
    /// assert!(err.is_retryable());
    ///
    /// let err = AppError::NotFound("group 42".to_string());
    /// assert!(!err.is_retryable());
    /// ```
    pub fn is_retryable(&self) -> bool {
        self.failure_kind() == FailureKind::Transient
    }

    /// Returns true if this error must abort the whole task.
    pub fn is_fatal(&self) -> bool {
        self.failure_kind() == FailureKind::Fatal
    }
}

/// Connection-level failures and serialization conflicts are worth another
/// attempt; constraint violations, decode errors and missing rows are not.
fn is_transient_sqlx(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => true,
        // serialization_failure, deadlock_detected
        sqlx::Error::Database(db) => matches!(db.code().as_deref(), Some("40001" | "40P01")),
        _ => false,
    }
}
