//! Per-user trading worker.
//!
//! One process per active session: runs an [`ExecutionHandler`](trader_engine::execution::ExecutionHandler)
//! and bridges it to the user's command and status queues.

pub mod session;

pub use session::{event_messages, WorkerSession, EXIT_OK, EXIT_REPORTED, EXIT_UNREPORTED};
