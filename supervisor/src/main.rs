use std::sync::Arc;

use anyhow::{Context, Result};
use shared::{consume_from, ChannelRetry, Config, MessageBus, RedisBus};
use supervisor::{ProcessLauncher, ProcessLifecycleManager, SupervisorOptions};
use tracing::info;
use tracing_subscriber::EnvFilter;

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

    info!("Starting trading supervisor...");
    let config = Config::from_env()?;
    let bus: Arc<dyn MessageBus> = Arc::new(RedisBus::open(&config.redis_url).context("opening message bus")?);
    let launcher = Arc::new(ProcessLauncher::new(config.worker_bin.clone()));
    let manager = Arc::new(ProcessLifecycleManager::new(
        launcher,
        bus.clone(),
        SupervisorOptions::from_config(&config),
    ));

    let monitor = manager.spawn_health_monitor(config.health_interval);
    let commands = consume_from(bus, config.lifecycle_queue.clone(), ChannelRetry::default());
    info!(queue = %config.lifecycle_queue, worker_bin = %config.worker_bin.display(), "Waiting for lifecycle commands");

    tokio::select! {
        _ = manager.serve(commands) => info!("Lifecycle queue closed"),
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            info!("Interrupt received");
        }
    }

    monitor.abort();
    manager.shutdown().await;
    info!("Supervisor stopped");
    Ok(())
}
