use clap::Parser;

/// Server configuration parsed from command line arguments and environment variables
#[derive(Parser, Debug, Clone)]
#[command(name = "gather-server")]
#[command(author, version, about = "REST API server and worker host for Gather")]
pub struct ServerConfig {
    /// PostgreSQL database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Base URL of the platform API, including the version prefix
    #[arg(long, env = "PLATFORM_API_URL")]
    pub platform_api_url: String,

    /// Access token sent as a bearer token to the platform API
    #[arg(long, env = "PLATFORM_ACCESS_TOKEN", hide_env_values = true)]
    pub platform_access_token: String,

    /// Server port to listen on
    #[arg(short, long, env = "PORT", default_value = "3000")]
    pub port: u16,

    /// Server host to bind to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Number of in-process workers (0 serves the API only)
    #[arg(long, env = "WORKERS", default_value = "2")]
    pub workers: usize,

    /// Sustained platform API requests per second, shared by all workers
    #[arg(long, env = "RATE_LIMIT_RPS", default_value = "5")]
    pub rate_limit_rps: u32,

    /// Platform API burst size
    #[arg(long, env = "RATE_LIMIT_BURST", default_value = "10")]
    pub rate_limit_burst: u32,

    /// Comma-separated allowed CORS origins, or "*"
    #[arg(long, env = "CORS_ORIGINS", default_value = "*")]
    pub cors_origins: String,

    /// Per-request timeout in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "30")]
    pub request_timeout_secs: u64,
}
