//! Data access boundary.
//!
//! A [`Repository`] serves OHLCV data and order operations. The variant is chosen when the
//! session is built: `Backtest` serves a preloaded dataset behind a simulated clock,
//! `Live` forwards to an [`ExchangeConnector`](crate::exchange::ExchangeConnector) with
//! bounded retries.

pub mod backtest;
pub mod live;

pub use backtest::*;
pub use live::*;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::data::{Candle, Timeframe};
use crate::error::RepositoryError;
use crate::exchange::{Order, OrderRequest};

pub type RepositoryResult<T> = Result<T, RepositoryError>;

pub enum Repository {
    Backtest(BacktestRepository),
    Live(LiveRepository),
}

impl Repository {
    /// Ascending, deduplicated candles. Missing bars stay missing.
    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> RepositoryResult<Vec<Candle>> {
        match self {
            Self::Backtest(repo) => repo.fetch_ohlcv(symbol, timeframe, since, limit),
            Self::Live(repo) => repo.fetch_ohlcv(symbol, timeframe, since, limit).await,
        }
    }

    pub async fn fetch_orders(&self, symbol: &str) -> RepositoryResult<BTreeMap<String, Order>> {
        match self {
            Self::Backtest(repo) => Ok(repo.fetch_orders(symbol)),
            Self::Live(repo) => repo.fetch_orders(symbol).await,
        }
    }

    pub async fn create_order(&mut self, request: &OrderRequest) -> RepositoryResult<Order> {
        match self {
            Self::Backtest(repo) => repo.create_order(request),
            Self::Live(repo) => repo.create_order(request).await,
        }
    }

    /// Fails with `OrderNotFound` when the order is unknown or already terminal.
    pub async fn cancel_order(&mut self, order_id: &str) -> RepositoryResult<Order> {
        match self {
            Self::Backtest(repo) => repo.cancel_order(order_id),
            Self::Live(repo) => repo.cancel_order(order_id).await,
        }
    }
}
