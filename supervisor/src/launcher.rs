//! Spawning worker processes.

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use shared::WorkerEnv;
use tokio::process::{Child, Command};
use tracing::info;

use crate::lifecycle::LifecycleError;

/// A running worker
#[async_trait]
pub trait WorkerHandle: Send {
    fn pid(&self) -> Option<u32>;

    /// Exit code if the worker has exited. Killed workers report `-1`.
    fn try_exit(&mut self) -> Result<Option<i32>, LifecycleError>;

    /// Wait for the worker to exit on its own
    async fn wait(&mut self) -> Result<i32, LifecycleError>;

    /// Force-terminate and reap
    async fn kill(&mut self) -> Result<(), LifecycleError>;
}

#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn launch(&self, env: &WorkerEnv) -> Result<Box<dyn WorkerHandle>, LifecycleError>;
}

/// Launches the `trader-worker` binary as a child process
pub struct ProcessLauncher {
    worker_bin: PathBuf,
}

impl ProcessLauncher {
    pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
        Self {
            worker_bin: worker_bin.into(),
        }
    }
}

#[async_trait]
impl WorkerLauncher for ProcessLauncher {
    async fn launch(&self, env: &WorkerEnv) -> Result<Box<dyn WorkerHandle>, LifecycleError> {
        let vars = env
            .to_vars()
            .map_err(|e| LifecycleError::Spawn(format!("session config not serialisable: {}", e)))?;

        let child = Command::new(&self.worker_bin)
            .envs(vars)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LifecycleError::Spawn(format!("{}: {}", self.worker_bin.display(), e)))?;

        info!(user_id = %env.user_id, pid = ?child.id(), bin = %self.worker_bin.display(), "Worker spawned");
        Ok(Box::new(ProcessHandle { child }))
    }
}

struct ProcessHandle {
    child: Child,
}

#[async_trait]
impl WorkerHandle for ProcessHandle {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    fn try_exit(&mut self) -> Result<Option<i32>, LifecycleError> {
        let status = self
            .child
            .try_wait()
            .map_err(|e| LifecycleError::Worker(format!("worker status unavailable: {}", e)))?;
        Ok(status.map(|s| s.code().unwrap_or(-1)))
    }

    async fn wait(&mut self) -> Result<i32, LifecycleError> {
        let status = self
            .child
            .wait()
            .await
            .map_err(|e| LifecycleError::Worker(format!("waiting on worker failed: {}", e)))?;
        Ok(status.code().unwrap_or(-1))
    }

    async fn kill(&mut self) -> Result<(), LifecycleError> {
        self.child
            .kill()
            .await
            .map_err(|e| LifecycleError::Worker(format!("killing worker failed: {}", e)))
    }
}
