//! Execution handler: drives the tick loop over the registered strategies.

pub mod builder;
pub mod events;
pub mod handler;

pub use builder::*;
pub use events::*;
pub use handler::*;
