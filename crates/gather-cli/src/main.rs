use std::path::Path;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use uuid::Uuid;

use gather_client::HttpPlatformClient;
use gather_core::{
    CollectConfig, CollectionService, DbConfig, HttpConfig, JobState, QueueConfig,
    RateLimitConfig, RateLimitedClient, StartNowOutcome, TaskOptions, TaskService,
    TaskStatusView, TracingReporter, TracingWorkerReporter, WorkerConfig, WorkerPool,
};
use gather_db::{JobRepository, TaskRepository};
use gather_cli::{Command, Config};

type PgTaskService = TaskService<TaskRepository, TaskRepository, JobRepository>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to install tracing subscriber")?;

    let config = Config::parse();

    info!("Connecting to database...");
    let pool = gather_db::connect(&config.database_url, &DbConfig::from_env()?)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .context("Failed to connect to database")?;
    gather_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let queue_config = QueueConfig::from_env()?;
    let collect_config = CollectConfig::from_env()?;
    let tasks = TaskRepository::new(pool.clone());
    let jobs = JobRepository::with_config(pool, queue_config.clone());
    let service = TaskService::new(tasks.clone(), tasks.clone(), jobs.clone())
        .with_progress(collect_config.progress.clone())
        .with_max_attempts(queue_config.max_attempts);

    match config.command {
        Command::Worker {
            workers,
            platform_api_url,
            platform_access_token,
            rate_limit_rps,
            rate_limit_burst,
        } => {
            let client = HttpPlatformClient::with_config(
                &platform_api_url,
                &platform_access_token,
                HttpConfig::from_env()?,
            )
            .context("Failed to initialize platform client")?;
            let rate_limit = RateLimitConfig::new(rate_limit_rps, rate_limit_burst)?;
            let client = RateLimitedClient::new(client, &rate_limit);

            let collector =
                CollectionService::with_config(tasks.clone(), tasks, client, collect_config);
            let pool = WorkerPool::new(jobs, collector, WorkerConfig::from_env()?, workers);
            run_workers(pool).await?;
        }
        Command::Submit {
            group_ids,
            file,
            max_comments,
        } => {
            let mut ids = group_ids;
            if let Some(path) = file {
                ids.extend(read_group_ids(&path)?);
            }
            submit(&service, ids, max_comments).await?;
        }
        Command::Status { task_id } => {
            let view = service.get_status(task_id).await?;
            print_status(&view);
        }
        Command::Cancel { task_id } => {
            let status = service.cancel(task_id).await?;
            println!("Task {}: {}", task_id, status);
            if status.is_terminal() {
                println!("Nothing left to cancel.");
            } else {
                println!("The worker stops at its next checkpoint.");
            }
        }
        Command::Start { task_id } => {
            start(&service, task_id).await?;
        }
        Command::Jobs { state, limit } => {
            list_jobs(&service, state.into(), limit).await?;
        }
    }

    Ok(())
}

async fn run_workers(
    pool: WorkerPool<
        JobRepository,
        TaskRepository,
        TaskRepository,
        RateLimitedClient<HttpPlatformClient>,
    >,
) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, releasing active jobs...");
        }
        signal_token.cancel();
    });

    info!("Starting {} workers", pool.pool_size());
    pool.run(shutdown, TracingWorkerReporter, TracingReporter)
        .await;
    Ok(())
}

async fn submit(
    service: &PgTaskService,
    group_ids: Vec<String>,
    max_comments: Option<u64>,
) -> anyhow::Result<()> {
    let options = TaskOptions {
        max_comments,
        ..TaskOptions::default()
    };
    let task = service.submit(&group_ids, options).await?;

    println!("Task submitted: {}", task.id);
    println!("  Groups:  {}", task.group_ids.len());
    println!("  Status:  {}", task.status);
    println!();
    println!("Follow progress with: gather status {}", task.id);
    Ok(())
}

async fn start(service: &PgTaskService, task_id: Uuid) -> anyhow::Result<()> {
    match service.start_now(task_id).await? {
        StartNowOutcome::Prioritized(job) => {
            println!("Job {} moved to the front of the queue.", job.id)
        }
        StartNowOutcome::Enqueued(job) => {
            println!("Job {} enqueued at the front of the queue.", job.id)
        }
        StartNowOutcome::AlreadyRunning(job) => println!(
            "Already running on {}.",
            job.worker_id.as_deref().unwrap_or("a worker")
        ),
        StartNowOutcome::AlreadyFinished(status) => println!("Task already {}.", status),
    }
    Ok(())
}

async fn list_jobs(service: &PgTaskService, state: JobState, limit: usize) -> anyhow::Result<()> {
    let jobs = service.list_jobs(state, limit).await?;
    let total = service.count_jobs(state).await?;

    println!("\n{} {} jobs (showing {})\n", total, state.as_str(), jobs.len());
    for job in &jobs {
        println!(
            "  {}  task {}  attempt {}/{}  {}",
            job.id,
            job.task_id,
            job.attempt,
            job.max_attempts,
            job.last_error.as_deref().unwrap_or("")
        );
    }
    println!();
    Ok(())
}

/// Reads group ids from a file: one per line, blank lines and `#` comments
/// are skipped.
fn read_group_ids(path: &Path) -> anyhow::Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read group ids from {}", path.display()))?;
    Ok(parse_group_ids(&contents))
}

fn parse_group_ids(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or("").trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn print_status(view: &TaskStatusView) {
    println!("\nTask {}\n", view.task_id);
    println!(
        "  {} {:>3}%  {} ({} phase)",
        create_progress_bar(view.progress.percentage),
        view.progress.percentage,
        view.status,
        view.phase
    );
    println!();
    for phase in &view.phases {
        println!(
            "  {:<9} {:>7} / {:<7}{}",
            phase.phase.as_str(),
            phase.processed,
            phase.total,
            if phase.estimated { " (estimated)" } else { "" }
        );
    }
    if view.cancel_requested && !view.status.is_terminal() {
        println!("\n  Cancellation requested.");
    }
    if !view.errors.is_empty() {
        println!("\n  Errors ({}):", view.errors.len());
        for err in view.errors.iter().take(10) {
            match &err.external_id {
                Some(id) => println!("    [{}] {}: {}", err.scope.as_str(), id, err.message),
                None => println!("    [{}] {}", err.scope.as_str(), err.message),
            }
        }
        if view.errors.len() > 10 {
            println!("    ... and {} more", view.errors.len() - 10);
        }
    }
    if let Some(finished_at) = view.finished_at {
        println!("\n  Finished at: {}", finished_at);
    }
    println!();
}

fn create_progress_bar(percentage: u8) -> String {
    let filled = (percentage.min(100) / 10) as usize;
    let empty = 10 - filled;
    format!("[{}{}]", "█".repeat(filled), "░".repeat(empty))
}
