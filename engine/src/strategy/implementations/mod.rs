//! Built-in strategy implementations

pub mod buy_and_hold;
pub mod rsi_strategy;
pub mod sma_cross;

pub use buy_and_hold::*;
pub use rsi_strategy::*;
pub use sma_cross::*;
