//! Process lifecycle management: one isolated worker process per active user session.

pub mod launcher;
pub mod lifecycle;

pub use launcher::{ProcessLauncher, WorkerHandle, WorkerLauncher};
pub use lifecycle::{LifecycleError, ProcessLifecycleManager, SessionState, SupervisorOptions};
