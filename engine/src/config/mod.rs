//! Configuration module

pub mod retry;
pub mod session;
pub mod strategy;

pub use retry::*;
pub use session::*;
pub use strategy::*;
