//! Per-user worker sessions.
//!
//! At most one worker runs per user. `start` spawns it wired to the user's channel,
//! `stop` asks it to stop over that channel and force-terminates it after the stop
//! timeout, and the health check clears sessions whose worker exited on its own.
//!
//! Workers exit with [`EXIT_REPORTED`] after publishing their own crash error; only
//! other nonzero exits are reported here as `worker_crashed`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::json;
use shared::{
    topic_hash, ChannelError, Config, ControlMessage, Deduplicator, MessageBus, MessageChannel,
    MessageStream, MessageType, WorkerEnv, EXIT_OK, EXIT_REPORTED,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use trader_engine::config::SessionConfig;

use crate::launcher::{WorkerHandle, WorkerLauncher};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("user {0} already has an active session")]
    SessionAlreadyActive(String),
    #[error("user {0} has no active session")]
    NoActiveSession(String),
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker process error: {0}")]
    Worker(String),
    #[error("invalid session config: {0}")]
    Config(String),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl LifecycleError {
    /// Error kind published to the user's status queue
    pub fn code(&self) -> &'static str {
        match self {
            Self::SessionAlreadyActive(_) => "session_already_active",
            Self::NoActiveSession(_) => "no_active_session",
            Self::Spawn(_) => "spawn_failed",
            Self::Worker(_) => "worker_error",
            Self::Config(_) => "configuration",
            Self::Channel(_) => "channel_delivery",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Stopping,
}

struct UserSession {
    state: SessionState,
    /// Taken out while a stop waits on the process
    handle: Option<Box<dyn WorkerHandle>>,
    started_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub channel_secret: String,
    pub redis_url: String,
    pub database_url: Option<String>,
    pub stop_timeout: Duration,
}

impl SupervisorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            channel_secret: config.channel_secret.clone(),
            redis_url: config.redis_url.clone(),
            database_url: config.database_url.clone(),
            stop_timeout: config.stop_timeout,
        }
    }
}

pub struct ProcessLifecycleManager {
    launcher: Arc<dyn WorkerLauncher>,
    bus: Arc<dyn MessageBus>,
    options: SupervisorOptions,
    sessions: Mutex<HashMap<String, UserSession>>,
}

impl ProcessLifecycleManager {
    pub fn new(launcher: Arc<dyn WorkerLauncher>, bus: Arc<dyn MessageBus>, options: SupervisorOptions) -> Self {
        Self {
            launcher,
            bus,
            options,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn channel(&self, user_id: &str) -> MessageChannel {
        MessageChannel::for_user(self.bus.clone(), user_id, &self.options.channel_secret)
    }

    async fn notify(&self, user_id: &str, message: ControlMessage) {
        if let Err(e) = self.channel(user_id).publish_status(&message).await {
            error!(user_id = %user_id, error = %e, "Failed to publish lifecycle status");
        }
    }

    async fn reject(&self, user_id: &str, err: LifecycleError) -> LifecycleError {
        warn!(user_id = %user_id, error = %err, "Lifecycle request rejected");
        self.notify(user_id, ControlMessage::error(user_id, err.code(), err.to_string()))
            .await;
        err
    }

    /// Spawn a worker for `user_id`. Rejected while a session is active or stopping.
    pub async fn start(&self, user_id: &str, mut config: SessionConfig) -> Result<(), LifecycleError> {
        let mut sessions = self.sessions.lock().await;
        if sessions.contains_key(user_id) {
            drop(sessions);
            return Err(self
                .reject(user_id, LifecycleError::SessionAlreadyActive(user_id.to_string()))
                .await);
        }

        config.user_id = user_id.to_string();
        if let Err(e) = config.validate() {
            drop(sessions);
            return Err(self.reject(user_id, LifecycleError::Config(e.to_string())).await);
        }

        // a stop addressed to the previous worker would end this one at once
        match self.channel(user_id).clear_commands().await {
            Ok(0) => {}
            Ok(discarded) => info!(user_id = %user_id, discarded, "Discarded stale commands"),
            Err(e) => {
                drop(sessions);
                return Err(self.reject(user_id, e.into()).await);
            }
        }

        let mode = config.mode;
        let env = WorkerEnv {
            user_id: user_id.to_string(),
            topic: topic_hash(user_id, &self.options.channel_secret),
            session: config,
            redis_url: self.options.redis_url.clone(),
            database_url: self.options.database_url.clone(),
        };
        let handle = match self.launcher.launch(&env).await {
            Ok(handle) => handle,
            Err(e) => {
                drop(sessions);
                return Err(self.reject(user_id, e).await);
            }
        };
        let pid = handle.pid();
        sessions.insert(
            user_id.to_string(),
            UserSession {
                state: SessionState::Active,
                handle: Some(handle),
                started_at: Utc::now(),
            },
        );
        drop(sessions);

        info!(user_id = %user_id, ?pid, ?mode, "Session started");
        self.notify(
            user_id,
            ControlMessage::status(user_id, "session_started", json!({ "mode": mode, "pid": pid })),
        )
        .await;
        Ok(())
    }

    /// Ask the worker to stop, wait up to the stop timeout, then force-terminate.
    /// Returns the worker's exit code (`-1` when it had to be killed).
    pub async fn stop(&self, user_id: &str) -> Result<i32, LifecycleError> {
        let taken = {
            let mut sessions = self.sessions.lock().await;
            match sessions.get_mut(user_id) {
                Some(session) if session.state == SessionState::Active => {
                    session.state = SessionState::Stopping;
                    session.handle.take().map(|handle| (handle, session.started_at))
                }
                _ => None,
            }
        };
        let Some((mut handle, started_at)) = taken else {
            return Err(self
                .reject(user_id, LifecycleError::NoActiveSession(user_id.to_string()))
                .await);
        };

        let stop = ControlMessage::stop(user_id).with_new_dedup_id();
        if let Err(e) = self.channel(user_id).publish_command(&stop).await {
            warn!(user_id = %user_id, error = %e, "Could not deliver stop, worker will be killed at timeout");
        }

        let waited = tokio::time::timeout(self.options.stop_timeout, handle.wait()).await;
        let (code, forced) = match waited {
            Ok(Ok(code)) => (code, false),
            Ok(Err(e)) => {
                warn!(user_id = %user_id, error = %e, "Waiting on worker failed, killing it");
                (terminate(handle.as_mut()).await, true)
            }
            Err(_) => {
                warn!(
                    user_id = %user_id,
                    timeout_secs = self.options.stop_timeout.as_secs(),
                    "Worker did not stop in time, killing it"
                );
                (terminate(handle.as_mut()).await, true)
            }
        };

        self.sessions.lock().await.remove(user_id);
        let uptime_secs = (Utc::now() - started_at).num_seconds();
        info!(user_id = %user_id, code, forced, uptime_secs, "Session stopped");
        self.notify(
            user_id,
            ControlMessage::status(user_id, "session_stopped", json!({ "exit_code": code, "forced": forced })),
        )
        .await;
        Ok(code)
    }

    /// Reap workers that exited on their own. Each one clears its session and is
    /// reported once: `worker_crashed` for a death the worker could not report itself,
    /// `session_stopped` otherwise.
    pub async fn check_health(&self) -> Vec<(String, i32)> {
        let exited: Vec<(String, i32)> = {
            let mut sessions = self.sessions.lock().await;
            let mut exited = Vec::new();
            for (user_id, session) in sessions.iter_mut() {
                let Some(handle) = session.handle.as_mut() else {
                    continue;
                };
                match handle.try_exit() {
                    Ok(Some(code)) => exited.push((user_id.clone(), code)),
                    Ok(None) => {}
                    Err(e) => warn!(user_id = %user_id, error = %e, "Health check failed"),
                }
            }
            for (user_id, _) in &exited {
                sessions.remove(user_id);
            }
            exited
        };

        for (user_id, code) in &exited {
            if matches!(*code, EXIT_OK | EXIT_REPORTED) {
                if *code == EXIT_OK {
                    info!(user_id = %user_id, "Worker finished");
                } else {
                    warn!(user_id = %user_id, code, "Worker exited after reporting a crash");
                }
                self.notify(
                    user_id,
                    ControlMessage::status(user_id, "session_stopped", json!({ "exit_code": code, "forced": false })),
                )
                .await;
            } else {
                error!(user_id = %user_id, code, "Worker crashed");
                self.notify(
                    user_id,
                    ControlMessage::error(user_id, "worker_crashed", format!("worker exited with code {}", code)),
                )
                .await;
            }
        }
        exited
    }

    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let exited = manager.check_health().await;
                if !exited.is_empty() {
                    debug!(count = exited.len(), "Reaped exited workers");
                }
            }
        })
    }

    /// Dispatch one lifecycle command from the shared queue
    pub async fn handle_message(&self, message: ControlMessage) {
        let user_id = message.user_id.clone();
        match message.kind {
            MessageType::Start => match serde_json::from_value::<SessionConfig>(message.payload) {
                Ok(config) => {
                    let _ = self.start(&user_id, config).await;
                }
                Err(e) => {
                    let _ = self.reject(&user_id, LifecycleError::Config(e.to_string())).await;
                }
            },
            MessageType::Stop => {
                let _ = self.stop(&user_id).await;
            }
            other => warn!(user_id = %user_id, kind = ?other, "Unsupported lifecycle message"),
        }
    }

    /// Consume lifecycle commands until the stream ends.
    ///
    /// Each command runs on its own task so a slow stop never holds up other users.
    /// Commands for the same user still run one after another, in queue order.
    pub async fn serve(self: &Arc<Self>, mut commands: MessageStream) {
        let mut dedup = Deduplicator::new(1024);
        let mut in_flight: HashMap<String, JoinHandle<()>> = HashMap::new();
        while let Some(item) = commands.next().await {
            match item {
                Ok(message) if dedup.is_duplicate(&message) => {
                    debug!(user_id = %message.user_id, "Duplicate lifecycle command ignored");
                }
                Ok(message) => {
                    in_flight.retain(|_, task| !task.is_finished());
                    let user_id = message.user_id.clone();
                    let previous = in_flight.remove(&user_id);
                    let manager = Arc::clone(self);
                    let task = tokio::spawn(async move {
                        if let Some(previous) = previous {
                            if let Err(e) = previous.await {
                                warn!(user_id = %message.user_id, error = %e, "Earlier lifecycle command failed");
                            }
                        }
                        manager.handle_message(message).await;
                    });
                    in_flight.insert(user_id, task);
                }
                Err(e) => warn!(error = %e, "Dropping malformed lifecycle command"),
            }
        }
        futures::future::join_all(in_flight.into_values()).await;
    }

    /// Stop every session, graceful first, forced after the stop timeout
    pub async fn shutdown(&self) {
        let users = self.active_sessions().await;
        info!(sessions = users.len(), "Shutting down all sessions");
        let stops = users.iter().map(|user_id| self.stop(user_id));
        for (user_id, result) in users.iter().zip(futures::future::join_all(stops).await) {
            if let Err(e) = result {
                warn!(user_id = %user_id, error = %e, "Stop during shutdown failed");
            }
        }
    }

    pub async fn active_sessions(&self) -> Vec<String> {
        let mut users: Vec<String> = self.sessions.lock().await.keys().cloned().collect();
        users.sort();
        users
    }

    pub async fn session_state(&self, user_id: &str) -> Option<SessionState> {
        self.sessions.lock().await.get(user_id).map(|s| s.state)
    }
}

async fn terminate(handle: &mut dyn WorkerHandle) -> i32 {
    if let Err(e) = handle.kill().await {
        error!(pid = ?handle.pid(), error = %e, "Failed to kill worker");
    }
    match handle.try_exit() {
        Ok(Some(code)) => code,
        _ => -1,
    }
}
