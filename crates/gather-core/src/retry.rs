//! Bounded retry of individual platform calls.
//!
//! Only transient failures are retried. Permanent and fatal failures are
//! returned immediately, and a transient failure that survives every attempt
//! is handed back to the caller, which records it as an item error.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::error::AppError;

/// Retry settings for a single platform call.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

/// The error that ended a retried call.
#[derive(Debug)]
pub struct RetryFailure {
    pub error: AppError,
    /// Attempts made before giving up.
    pub attempts: u32,
}

impl RetryFailure {
    /// Whether the call failed on a transient error every time.
    pub fn exhausted(&self) -> bool {
        self.error.is_retryable()
    }

    /// Message suitable for a task error entry.
    pub fn describe(&self) -> String {
        if self.exhausted() {
            format!("{} (gave up after {} attempts)", self.error, self.attempts)
        } else {
            self.error.to_string()
        }
    }
}

impl RetryPolicy {
    /// No delay between attempts. Useful in tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Sleep after the `attempt`-th failure: `base × 2^(attempt-1)`, capped.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 1).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Runs `operation` until it succeeds, fails non-transiently, or the
    /// attempts run out.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, RetryFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        call = label,
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Transient failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => {
                    return Err(RetryFailure {
                        error,
                        attempts: attempt,
                    });
                }
            }
        }
    }
}
