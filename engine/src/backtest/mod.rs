//! Backtest reporting module
//!
//! Summarises a finished backtest run: returns, trade statistics and drawdown.

pub mod metrics;
pub mod report;

pub use metrics::*;
pub use report::*;
