//! Gather REST API Server
//!
//! This binary starts the Gather REST API and, unless `--workers 0` is given,
//! a pool of in-process workers draining the collection queue.

use std::net::SocketAddr;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gather_client::HttpPlatformClient;
use gather_core::{
    CollectConfig, CollectionService, DbConfig, HttpConfig, QueueConfig, RateLimitConfig,
    RateLimitedClient, TracingReporter, TracingWorkerReporter, WorkerConfig, WorkerPool,
};
use gather_db::{JobRepository, TaskRepository};

use gather_server::{AppState, ServerConfig, create_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv().ok();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Parse command line arguments
    let config = ServerConfig::parse();

    let queue_config = QueueConfig::from_env()?;
    let collect_config = CollectConfig::from_env()?;
    let worker_config = WorkerConfig::from_env()?;

    // Connect to database
    info!("Connecting to database...");
    let pool = gather_db::connect(&config.database_url, &DbConfig::from_env()?)
        .await
        .context("Failed to connect to database")?;
    gather_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    info!("Database connection established");

    // Create shutdown token for graceful shutdown
    let shutdown_token = CancellationToken::new();

    // Start the worker pool
    let workers = if config.workers > 0 {
        let client = HttpPlatformClient::with_config(
            &config.platform_api_url,
            &config.platform_access_token,
            HttpConfig::from_env()?,
        )
        .context("Failed to initialize platform client")?;
        let rate_limit = RateLimitConfig::new(config.rate_limit_rps, config.rate_limit_burst)?;
        let client = RateLimitedClient::new(client, &rate_limit);

        let tasks = TaskRepository::new(pool.clone());
        let collector =
            CollectionService::with_config(tasks.clone(), tasks, client, collect_config.clone());
        let worker_pool = WorkerPool::new(
            JobRepository::with_config(pool.clone(), queue_config.clone()),
            collector,
            worker_config,
            config.workers,
        );

        let token = shutdown_token.clone();
        Some(tokio::spawn(async move {
            worker_pool
                .run(token, TracingWorkerReporter, TracingReporter)
                .await
        }))
    } else {
        info!("Workers disabled, serving the API only");
        None
    };

    // Create application state
    let app_state = AppState::new(
        pool,
        queue_config,
        collect_config.progress,
        shutdown_token.clone(),
    );

    // Build router
    let app = create_router(app_state, &config);

    // Bind to address
    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("Invalid address")?;

    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!("Starting Gather API server on http://{}", addr);
    info!("Swagger UI available at http://{}/swagger-ui", addr);

    // Start server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown_token.clone()))
        .await
        .context("Server error")?;

    // Workers release their current job before exiting.
    shutdown_token.cancel();
    if let Some(handle) = workers {
        handle.await.context("Worker pool panicked")?;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal(shutdown_token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
        _ = shutdown_token.cancelled() => {},
    }

    info!("Shutdown signal received, starting graceful shutdown...");

    // Cancel the shutdown token to signal workers
    shutdown_token.cancel();
}
