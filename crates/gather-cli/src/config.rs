use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use uuid::Uuid;

use gather_core::JobState;

/// CLI configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug)]
#[command(name = "gather")]
#[command(author, version, about = "Durable collection of groups, posts and comments")]
#[command(after_help = "Examples:
  gather worker --workers 4
  gather submit 123456789 987654321 --max-comments 5000
  gather submit --file groups.txt
  gather status 5f0c6f0e-8a4e-4c4b-9c1e-0b6f9d3c2a11
  gather jobs --state dead")]
pub struct Config {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    #[command(subcommand)]
    pub command: Command,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a pool of workers draining the collection queue until Ctrl+C
    Worker {
        /// Number of concurrent workers
        #[arg(short, long, env = "WORKERS", default_value = "2")]
        workers: usize,

        /// Base URL of the platform API, including the version prefix
        #[arg(long, env = "PLATFORM_API_URL")]
        platform_api_url: String,

        /// Access token sent as a bearer token to the platform API
        #[arg(long, env = "PLATFORM_ACCESS_TOKEN", hide_env_values = true)]
        platform_access_token: String,

        /// Sustained platform API requests per second, shared by all workers
        #[arg(long, env = "RATE_LIMIT_RPS", default_value = "5")]
        rate_limit_rps: u32,

        /// Platform API burst size
        #[arg(long, env = "RATE_LIMIT_BURST", default_value = "10")]
        rate_limit_burst: u32,
    },
    /// Submit a collection task for one or more groups
    #[command(after_help = "Group ids from arguments and --file are merged; duplicates are dropped.")]
    Submit {
        /// Platform group identifiers
        #[arg(value_name = "GROUP_ID")]
        group_ids: Vec<String>,

        /// Read group ids from a file, one per line (# starts a comment)
        #[arg(short, long, value_name = "PATH")]
        file: Option<PathBuf>,

        /// Stop counting comments beyond this many
        #[arg(long)]
        max_comments: Option<u64>,
    },
    /// Show the status and progress of a task
    Status {
        /// Task id returned by `gather submit`
        task_id: Uuid,
    },
    /// Cancel a task
    Cancel {
        task_id: Uuid,
    },
    /// Move a task to the front of the queue
    Start {
        task_id: Uuid,
    },
    /// List jobs in the queue
    Jobs {
        /// Job state to list
        #[arg(short, long, default_value = "waiting")]
        state: JobStateArg,

        /// Maximum number of jobs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

/// Job states accepted on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum JobStateArg {
    Waiting,
    Active,
    Completed,
    Dead,
}

impl From<JobStateArg> for JobState {
    fn from(arg: JobStateArg) -> Self {
        match arg {
            JobStateArg::Waiting => JobState::Waiting,
            JobStateArg::Active => JobState::Active,
            JobStateArg::Completed => JobState::Completed,
            JobStateArg::Dead => JobState::Dead,
        }
    }
}
