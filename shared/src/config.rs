use std::path::PathBuf;
use std::time::Duration;

use dotenv::dotenv;

/// Process-level settings shared by the supervisor and its workers
#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub database_url: Option<String>,
    /// Mixed into every per-user topic hash; never published
    pub channel_secret: String,
    pub worker_bin: PathBuf,
    pub stop_timeout: Duration,
    pub health_interval: Duration,
    pub lifecycle_queue: String,
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenv().ok();

        Ok(Config {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()),
            channel_secret: std::env::var("CHANNEL_SECRET")
                .map_err(|_| anyhow::anyhow!("CHANNEL_SECRET must be set"))?,
            worker_bin: std::env::var("WORKER_BIN")
                .unwrap_or_else(|_| "trader-worker".to_string())
                .into(),
            stop_timeout: Duration::from_secs(parse_secs("STOP_TIMEOUT_SECS", 10)?),
            health_interval: Duration::from_secs(parse_secs("HEALTH_INTERVAL_SECS", 5)?.max(1)),
            lifecycle_queue: std::env::var("LIFECYCLE_QUEUE")
                .unwrap_or_else(|_| "lifecycle.cmd".to_string()),
        })
    }
}

fn parse_secs(key: &str, default: u64) -> Result<u64, anyhow::Error> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} must be a whole number of seconds: {}", key, e)),
        Err(_) => Ok(default),
    }
}
