//! Gather Server - REST API for Gather collection tasks
//!
//! This crate provides an HTTP API over the task service:
//!
//! - **Tasks**: Submit collections, poll their status, cancel or force-start them
//! - **Jobs**: Inspect the job queue by state
//! - **Health**: Liveness and database connectivity
//!
//! The same binary hosts the worker pool that drains the queue.
//!
//! # API Documentation
//!
//! When running the server, interactive API documentation is available
//! at `/swagger-ui`.

pub mod config;
pub mod dto;
pub mod error;
pub mod handlers;
pub mod openapi;
pub mod router;
pub mod state;

pub use config::ServerConfig;
pub use error::ApiError;
pub use router::create_router;
pub use state::AppState;
