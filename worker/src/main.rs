use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{get_db_connection, MessageBus, MessageChannel, RedisBus, SessionStore, WorkerEnv};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use trader_worker::WorkerSession;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if std::env::var("LOG_FORMAT").is_ok_and(|format| format.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let env = WorkerEnv::from_env().context("reading worker environment")?;
    info!(user_id = %env.user_id, mode = ?env.session.mode, strategies = env.session.strategies.len(), "Starting trading worker");

    let bus: Arc<dyn MessageBus> = Arc::new(RedisBus::open(&env.redis_url).context("opening message bus")?);
    let mut session = WorkerSession::new(env.user_id.clone(), MessageChannel::new(bus, env.topic.clone()));

    if let Some(url) = &env.database_url {
        match get_db_connection(url).await {
            Ok(db) => session = session.with_store(SessionStore::new(Arc::new(db), env.user_id.clone())),
            Err(e) => warn!(error = %e, "Database unavailable, session state will not be persisted"),
        }
    }

    let code = session.run(env.session).await;
    info!(user_id = %env.user_id, code, "Worker exiting");
    std::process::exit(code);
}
