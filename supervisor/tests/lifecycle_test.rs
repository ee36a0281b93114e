//! Lifecycle manager tests with a fake worker launcher

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use shared::{
    command_queue, consume_from, publish_to, status_queue, topic_hash, ChannelRetry, ControlMessage, MemoryBus,
    MessageBus, MessageType, WorkerEnv, EXIT_REPORTED,
};
use supervisor::{LifecycleError, ProcessLifecycleManager, SessionState, SupervisorOptions, WorkerHandle, WorkerLauncher};
use trader_engine::config::{SessionConfig, StrategySpec, TradingMode};
use trader_engine::data::Timeframe;

const SECRET: &str = "lifecycle-secret";
const LIFECYCLE_QUEUE: &str = "lifecycle.cmd";

#[derive(Debug, Default)]
struct FakeProcess {
    exit: Option<i32>,
    killed: bool,
}

type Process = Arc<Mutex<FakeProcess>>;

struct FakeHandle {
    process: Process,
    /// exits with 0 as soon as it is waited on
    graceful: bool,
}

#[async_trait]
impl WorkerHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        Some(4242)
    }

    fn try_exit(&mut self) -> Result<Option<i32>, LifecycleError> {
        Ok(self.process.lock().unwrap().exit)
    }

    async fn wait(&mut self) -> Result<i32, LifecycleError> {
        loop {
            {
                let mut process = self.process.lock().unwrap();
                if self.graceful && process.exit.is_none() {
                    process.exit = Some(0);
                }
                if let Some(code) = process.exit {
                    return Ok(code);
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    async fn kill(&mut self) -> Result<(), LifecycleError> {
        let mut process = self.process.lock().unwrap();
        process.killed = true;
        process.exit = Some(-1);
        Ok(())
    }
}

#[derive(Default)]
struct FakeLauncher {
    graceful: bool,
    fail: bool,
    launched: Mutex<Vec<(WorkerEnv, Process)>>,
}

impl FakeLauncher {
    fn graceful() -> Self {
        Self {
            graceful: true,
            ..Self::default()
        }
    }

    fn count(&self) -> usize {
        self.launched.lock().unwrap().len()
    }

    fn process(&self, n: usize) -> Process {
        self.launched.lock().unwrap()[n].1.clone()
    }

    fn env(&self, n: usize) -> WorkerEnv {
        self.launched.lock().unwrap()[n].0.clone()
    }
}

#[async_trait]
impl WorkerLauncher for FakeLauncher {
    async fn launch(&self, env: &WorkerEnv) -> Result<Box<dyn WorkerHandle>, LifecycleError> {
        if self.fail {
            return Err(LifecycleError::Spawn("trader-worker: No such file or directory".to_string()));
        }
        let process = Process::default();
        self.launched.lock().unwrap().push((env.clone(), process.clone()));
        Ok(Box::new(FakeHandle {
            process,
            graceful: self.graceful,
        }))
    }
}

fn session_config() -> SessionConfig {
    let mut config = SessionConfig::new("", TradingMode::Backtest, Timeframe::H1);
    config.strategies = vec![StrategySpec::new("rsi", "BTCUSDT")];
    config.datasets.insert("BTCUSDT".to_string(), "data/btcusdt_1h.csv".into());
    config
}

fn manager(launcher: Arc<FakeLauncher>, bus: Arc<MemoryBus>, stop_timeout: Duration) -> Arc<ProcessLifecycleManager> {
    let options = SupervisorOptions {
        channel_secret: SECRET.to_string(),
        redis_url: "redis://localhost:6379".to_string(),
        database_url: None,
        stop_timeout,
    };
    Arc::new(ProcessLifecycleManager::new(launcher, bus, options))
}

fn statuses(bus: &MemoryBus, user_id: &str) -> Vec<ControlMessage> {
    bus.drain(&status_queue(&topic_hash(user_id, SECRET)))
        .iter()
        .map(|raw| ControlMessage::from_json(raw).unwrap())
        .collect()
}

fn events(messages: &[ControlMessage]) -> Vec<String> {
    messages.iter().filter_map(|m| m.event().map(str::to_string)).collect()
}

#[tokio::test]
async fn second_start_is_rejected_while_active() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(10));

    manager.start("42", session_config()).await.unwrap();
    let second = manager.start("42", session_config()).await;

    assert!(matches!(second, Err(LifecycleError::SessionAlreadyActive(_))));
    assert_eq!(launcher.count(), 1);
    assert_eq!(events(&statuses(&bus, "42")), vec!["session_started", "session_already_active"]);
    assert_eq!(manager.session_state("42").await, Some(SessionState::Active));
}

#[tokio::test]
async fn worker_gets_the_hashed_topic_and_its_user_config() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let manager = manager(launcher.clone(), Arc::new(MemoryBus::new()), Duration::from_secs(10));

    manager.start("42", session_config()).await.unwrap();

    let env = launcher.env(0);
    assert_eq!(env.topic, topic_hash("42", SECRET));
    assert_eq!(env.session.user_id, "42");
    let vars = env.to_vars().unwrap();
    assert!(vars.iter().all(|(_, value)| !value.contains(SECRET)));
}

#[tokio::test]
async fn stop_sends_cancellation_and_waits_for_graceful_exit() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(10));
    manager.start("42", session_config()).await.unwrap();

    let code = manager.stop("42").await.unwrap();

    assert_eq!(code, 0);
    assert!(!launcher.process(0).lock().unwrap().killed);
    let commands = bus.drain(&command_queue(&topic_hash("42", SECRET)));
    let stop = ControlMessage::from_json(&commands[0]).unwrap();
    assert_eq!(stop.kind, MessageType::Stop);
    assert!(stop.dedup_id.is_some());

    let messages = statuses(&bus, "42");
    assert_eq!(events(&messages), vec!["session_started", "session_stopped"]);
    assert_eq!(messages[1].payload["data"]["forced"], false);

    // session cleared, a new start is accepted
    assert!(manager.active_sessions().await.is_empty());
    manager.start("42", session_config()).await.unwrap();
    assert_eq!(launcher.count(), 2);
}

#[tokio::test(start_paused = true)]
async fn stop_force_terminates_after_timeout() {
    let launcher = Arc::new(FakeLauncher::default());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(3));
    manager.start("42", session_config()).await.unwrap();

    let code = manager.stop("42").await.unwrap();

    assert_eq!(code, -1);
    assert!(launcher.process(0).lock().unwrap().killed);
    let messages = statuses(&bus, "42");
    assert_eq!(messages.last().unwrap().payload["data"]["forced"], true);
    assert!(manager.active_sessions().await.is_empty());
}

#[tokio::test]
async fn stop_without_session_is_reported() {
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(Arc::new(FakeLauncher::graceful()), bus.clone(), Duration::from_secs(1));

    let result = manager.stop("7").await;

    assert!(matches!(result, Err(LifecycleError::NoActiveSession(_))));
    assert_eq!(events(&statuses(&bus, "7")), vec!["no_active_session"]);
}

#[tokio::test]
async fn crashed_worker_is_reported_once_and_cleared() {
    let launcher = Arc::new(FakeLauncher::default());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    manager.start("42", session_config()).await.unwrap();
    assert!(manager.check_health().await.is_empty());

    launcher.process(0).lock().unwrap().exit = Some(1);

    assert_eq!(manager.check_health().await, vec![("42".to_string(), 1)]);
    assert!(manager.check_health().await.is_empty());
    let messages = statuses(&bus, "42");
    let errors: Vec<&ControlMessage> = messages.iter().filter(|m| m.kind == MessageType::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event(), Some("worker_crashed"));

    manager.start("42", session_config()).await.unwrap();
    assert_eq!(launcher.count(), 2);
}

#[tokio::test]
async fn crash_the_worker_already_reported_is_not_reported_again() {
    let launcher = Arc::new(FakeLauncher::default());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    manager.start("42", session_config()).await.unwrap();

    launcher.process(0).lock().unwrap().exit = Some(EXIT_REPORTED);

    assert_eq!(manager.check_health().await, vec![("42".to_string(), EXIT_REPORTED)]);
    let messages = statuses(&bus, "42");
    assert!(messages.iter().all(|m| m.kind == MessageType::Status));
    assert_eq!(events(&messages), vec!["session_started", "session_stopped"]);
    assert_eq!(messages[1].payload["data"]["exit_code"], EXIT_REPORTED);
    assert_eq!(manager.session_state("42").await, None);
}

#[tokio::test]
async fn start_discards_commands_left_for_an_earlier_worker() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    let queue = command_queue(&topic_hash("42", SECRET));
    let stale = ControlMessage::stop("42").with_dedup_id("old-stop");
    bus.push(&queue, stale.to_json().unwrap()).await.unwrap();

    manager.start("42", session_config()).await.unwrap();

    assert_eq!(bus.len(&queue), 0);
    assert_eq!(manager.session_state("42").await, Some(SessionState::Active));
}

#[tokio::test]
async fn clean_exit_clears_the_session_without_error() {
    let launcher = Arc::new(FakeLauncher::default());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    manager.start("42", session_config()).await.unwrap();

    launcher.process(0).lock().unwrap().exit = Some(0);
    manager.check_health().await;

    assert_eq!(events(&statuses(&bus, "42")), vec!["session_started", "session_stopped"]);
    assert_eq!(manager.session_state("42").await, None);
}

#[tokio::test(start_paused = true)]
async fn health_monitor_reaps_dead_workers() {
    let launcher = Arc::new(FakeLauncher::default());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    manager.start("42", session_config()).await.unwrap();
    let monitor = manager.spawn_health_monitor(Duration::from_secs(5));

    launcher.process(0).lock().unwrap().exit = Some(137);
    tokio::time::sleep(Duration::from_secs(6)).await;

    assert!(manager.active_sessions().await.is_empty());
    assert!(events(&statuses(&bus, "42")).contains(&"worker_crashed".to_string()));
    monitor.abort();
}

#[tokio::test]
async fn spawn_failure_leaves_no_session() {
    let launcher = Arc::new(FakeLauncher {
        fail: true,
        ..FakeLauncher::default()
    });
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher, bus.clone(), Duration::from_secs(1));

    let result = manager.start("42", session_config()).await;

    assert!(matches!(result, Err(LifecycleError::Spawn(_))));
    assert_eq!(events(&statuses(&bus, "42")), vec!["spawn_failed"]);
    assert!(manager.active_sessions().await.is_empty());
}

#[tokio::test]
async fn invalid_config_is_rejected_before_spawning() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    let mut config = session_config();
    config.strategies.clear();

    assert!(matches!(manager.start("42", config).await, Err(LifecycleError::Config(_))));
    assert_eq!(launcher.count(), 0);
    assert_eq!(events(&statuses(&bus, "42")), vec!["configuration"]);
}

#[tokio::test(start_paused = true)]
async fn serve_dispatches_lifecycle_queue_and_skips_duplicates() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    let retry = ChannelRetry::default();

    let config = serde_json::to_value(session_config()).unwrap();
    let start = ControlMessage::start("42", config.clone()).with_dedup_id("start-1");
    for message in [
        start.clone(),
        start,
        ControlMessage::start("43", json!({"mode": "nonsense"})),
        ControlMessage::start("44", config).with_dedup_id("start-2"),
        ControlMessage::stop("44"),
    ] {
        publish_to(bus.as_ref(), &retry, LIFECYCLE_QUEUE, &message).await.unwrap();
    }

    let commands = consume_from(bus.clone(), LIFECYCLE_QUEUE.to_string(), retry);
    let _ = tokio::time::timeout(Duration::from_secs(2), manager.serve(commands)).await;

    assert_eq!(launcher.count(), 2);
    assert_eq!(manager.active_sessions().await, vec!["42".to_string()]);
    assert_eq!(events(&statuses(&bus, "42")), vec!["session_started"]);
    assert_eq!(events(&statuses(&bus, "43")), vec!["configuration"]);
    assert_eq!(events(&statuses(&bus, "44")), vec!["session_started", "session_stopped"]);
}

#[tokio::test(start_paused = true)]
async fn slow_stop_does_not_hold_up_other_users() {
    // never exits on its own, so a stop waits out the full timeout
    let launcher = Arc::new(FakeLauncher::default());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(30));
    let retry = ChannelRetry::default();
    let config = serde_json::to_value(session_config()).unwrap();

    manager.start("A", session_config()).await.unwrap();
    for message in [ControlMessage::stop("A"), ControlMessage::start("B", config)] {
        publish_to(bus.as_ref(), &retry, LIFECYCLE_QUEUE, &message).await.unwrap();
    }

    let commands = consume_from(bus.clone(), LIFECYCLE_QUEUE.to_string(), retry);
    let _ = tokio::time::timeout(Duration::from_secs(2), manager.serve(commands)).await;

    assert_eq!(manager.session_state("A").await, Some(SessionState::Stopping));
    assert_eq!(manager.session_state("B").await, Some(SessionState::Active));
    assert_eq!(events(&statuses(&bus, "B")), vec!["session_started"]);

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(manager.active_sessions().await, vec!["B".to_string()]);
    assert!(launcher.process(0).lock().unwrap().killed);
}

#[tokio::test]
async fn shutdown_stops_every_session() {
    let launcher = Arc::new(FakeLauncher::graceful());
    let bus = Arc::new(MemoryBus::new());
    let manager = manager(launcher.clone(), bus.clone(), Duration::from_secs(1));
    for user in ["1", "2", "3"] {
        manager.start(user, session_config()).await.unwrap();
    }

    manager.shutdown().await;

    assert!(manager.active_sessions().await.is_empty());
    for user in ["1", "2", "3"] {
        assert_eq!(events(&statuses(&bus, user)).last().map(String::as_str), Some("session_stopped"));
    }
}
