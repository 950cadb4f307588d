//! Rate-limited platform client wrapper.
//!
//! Wraps any [`PlatformClient`] with a token bucket from the governor crate.
//! Clones share the same bucket, so one limiter governs every worker of the
//! process. The bucket is lock-free; nothing is held across an `.await`.

use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

use crate::error::AppError;
use crate::models::{Comment, Group, Page, Post};
use crate::traits::PlatformClient;

/// What to do when the bucket is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    /// Wait for the next permit.
    Wait,
    /// Fail with [`AppError::RateLimitExceeded`], a transient error the
    /// caller's retry policy backs off from.
    Reject,
}

/// Token bucket settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained rate.
    pub requests_per_second: NonZeroU32,
    /// Maximum burst size.
    pub burst: NonZeroU32,
    pub mode: RateLimitMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: NonZeroU32::new(5).unwrap_or(NonZeroU32::MIN),
            burst: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            mode: RateLimitMode::Wait,
        }
    }
}

impl RateLimitConfig {
    /// Builds a config, rejecting zero rates.
    pub fn new(requests_per_second: u32, burst: u32) -> Result<Self, AppError> {
        let rps = NonZeroU32::new(requests_per_second).ok_or_else(|| {
            AppError::ConfigError("requests_per_second must be > 0".to_string())
        })?;
        let burst = NonZeroU32::new(burst)
            .ok_or_else(|| AppError::ConfigError("burst must be > 0".to_string()))?;
        Ok(Self {
            requests_per_second: rps,
            burst,
            mode: RateLimitMode::Wait,
        })
    }

    pub fn with_mode(mut self, mode: RateLimitMode) -> Self {
        self.mode = mode;
        self
    }

    fn quota(&self) -> Quota {
        Quota::per_second(self.requests_per_second).allow_burst(self.burst)
    }
}

/// A platform client that enforces a shared rate limit.
#[derive(Clone)]
pub struct RateLimitedClient<C> {
    inner: C,
    limiter: Arc<DefaultDirectRateLimiter>,
    mode: RateLimitMode,
}

impl<C: PlatformClient> RateLimitedClient<C> {
    /// Create a new rate-limited client with its own bucket.
    pub fn new(inner: C, config: &RateLimitConfig) -> Self {
        Self {
            inner,
            limiter: Arc::new(RateLimiter::direct(config.quota())),
            mode: config.mode,
        }
    }

    /// Create a client sharing an existing bucket.
    pub fn with_limiter(inner: C, limiter: Arc<DefaultDirectRateLimiter>, mode: RateLimitMode) -> Self {
        Self {
            inner,
            limiter,
            mode,
        }
    }

    /// The shared bucket, for wrapping further clients.
    pub fn limiter(&self) -> Arc<DefaultDirectRateLimiter> {
        Arc::clone(&self.limiter)
    }

    async fn acquire(&self) -> Result<(), AppError> {
        match self.mode {
            RateLimitMode::Wait => {
                self.limiter.until_ready().await;
                Ok(())
            }
            RateLimitMode::Reject => self
                .limiter
                .check()
                .map_err(|_| AppError::RateLimitExceeded),
        }
    }
}

impl<C: PlatformClient> PlatformClient for RateLimitedClient<C> {
    async fn fetch_group(&self, group_id: &str) -> Result<Group, AppError> {
        self.acquire().await?;
        self.inner.fetch_group(group_id).await
    }

    async fn fetch_posts(&self, group_id: &str, cursor: Option<&str>) -> Result<Page<Post>, AppError> {
        self.acquire().await?;
        self.inner.fetch_posts(group_id, cursor).await
    }

    async fn fetch_comments(
        &self,
        post_id: &str,
        cursor: Option<&str>,
    ) -> Result<Page<Comment>, AppError> {
        self.acquire().await?;
        self.inner.fetch_comments(post_id, cursor).await
    }
}
