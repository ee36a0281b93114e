//! Environment handed from the supervisor to a worker process.

use trader_engine::config::SessionConfig;

pub const USER_ID: &str = "USER_ID";
pub const CHANNEL_TOPIC: &str = "CHANNEL_TOPIC";
pub const SESSION_CONFIG: &str = "SESSION_CONFIG";
pub const REDIS_URL: &str = "REDIS_URL";
pub const DATABASE_URL: &str = "DATABASE_URL";

/// Clean exit after a stop request or exhausted data
pub const EXIT_OK: i32 = 0;
/// The worker crashed and already published the error to its status queue. Any other
/// nonzero code is a death the supervisor still has to report.
pub const EXIT_REPORTED: i32 = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerEnv {
    pub user_id: String,
    /// Hashed topic; the worker never sees the channel secret
    pub topic: String,
    pub session: SessionConfig,
    pub redis_url: String,
    pub database_url: Option<String>,
}

impl WorkerEnv {
    /// Variables to set on the spawned process
    pub fn to_vars(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut vars = vec![
            (USER_ID, self.user_id.clone()),
            (CHANNEL_TOPIC, self.topic.clone()),
            (SESSION_CONFIG, serde_json::to_string(&self.session)?),
            (REDIS_URL, self.redis_url.clone()),
        ];
        if let Some(url) = &self.database_url {
            vars.push((DATABASE_URL, url.clone()));
        }
        Ok(vars)
    }

    pub fn from_env() -> Result<Self, anyhow::Error> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, anyhow::Error> {
        let require = |key: &str| lookup(key).ok_or_else(|| anyhow::anyhow!("{} must be set", key));

        let user_id = require(USER_ID)?;
        let mut session: SessionConfig = serde_json::from_str(&require(SESSION_CONFIG)?)
            .map_err(|e| anyhow::anyhow!("{} is not a valid session config: {}", SESSION_CONFIG, e))?;
        if session.user_id.is_empty() {
            session.user_id = user_id.clone();
        }
        if session.user_id != user_id {
            anyhow::bail!(
                "session config belongs to user {} but worker runs for {}",
                session.user_id,
                user_id
            );
        }

        Ok(Self {
            user_id,
            topic: require(CHANNEL_TOPIC)?,
            session,
            redis_url: require(REDIS_URL)?,
            database_url: lookup(DATABASE_URL).filter(|url| !url.is_empty()),
        })
    }
}
