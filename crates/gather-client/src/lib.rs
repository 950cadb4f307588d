//! Gather Client - HTTP client for the external platform API
//!
//! This crate provides [`HttpPlatformClient`], the `reqwest` implementation of
//! [`gather_core::PlatformClient`].
//!
//! # Overview
//!
//! The client handles authentication, request building, response parsing and
//! the mapping of HTTP statuses onto [`gather_core::AppError`]. Retries and
//! rate limiting are not its concern: wrap it in
//! [`gather_core::RateLimitedClient`] and let the pipeline's `RetryPolicy`
//! handle transient failures.

pub mod platform;
pub mod wire;

// Re-export main client types
pub use platform::{HttpPlatformClient, validate_id};
