//! Trader engine: one strategy codebase, two execution modes.
//!
//! The engine is layered the same way for backtests and live exchanges:
//!
//! - **Repository**: data access boundary (OHLCV, order fetch/create/cancel)
//! - **Broker**: owns one repository and the account state, simulates fills in backtests
//! - **Strategy**: pluggable decision logic invoked once per tick and symbol
//! - **ExecutionHandler**: drives the tick loop over the registered strategies
//!
//! Each role is a tagged variant (`Backtest` / `Live`) chosen when the session is built,
//! so strategy code never knows which mode it runs in.
//!
//! # Example
//!
//! ```no_run
//! use trader_engine::prelude::*;
//!
//! # async fn demo(config: SessionConfig) -> Result<(), Box<dyn std::error::Error>> {
//! let mut handler = build_handler(&config)?;
//! let (_cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
//! let summary = handler.run(cancel_rx).await?;
//! println!("final equity: {:.2}", summary.account.equity);
//! # Ok(())
//! # }
//! ```

pub mod backtest;
pub mod broker;
pub mod config;
pub mod data;
pub mod error;
pub mod exchange;
pub mod execution;
pub mod indicators;
pub mod portfolio;
pub mod repository;
pub mod strategy;

// Re-export commonly used types
pub mod prelude {
    pub use crate::backtest::*;
    pub use crate::broker::*;
    pub use crate::config::*;
    pub use crate::data::*;
    pub use crate::error::*;
    pub use crate::exchange::*;
    pub use crate::execution::*;
    pub use crate::portfolio::*;
    pub use crate::repository::*;
    pub use crate::strategy::*;
}
