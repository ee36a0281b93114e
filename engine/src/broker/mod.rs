//! Broker: account, order and data access for strategies.
//!
//! A [`Broker`] owns exactly one repository and the session's [`AccountState`]. Strategies
//! only ever talk to the broker, so the same strategy code runs against a backtest or a
//! live exchange.

pub mod backtest;
pub mod fill;
pub mod live;

pub use backtest::*;
pub use fill::{evaluate, rank, FillDecision};
pub use live::*;

use chrono::{DateTime, Utc};

use crate::config::{SessionConfig, TradingMode};
use crate::data::Candle;
use crate::error::BrokerError;
use crate::exchange::{Order, OrderRequest, OrderType};
use crate::portfolio::{AccountState, Fill, Position};
use crate::repository::Repository;

pub enum Broker {
    Backtest(BacktestBroker),
    Live(LiveBroker),
}

/// Reject malformed requests before they reach the risk check or the repository.
///
/// `last_price` prices market entries when their contingent exits are checked: a
/// stop-loss must sit on the losing side of the entry and a take-profit on the winning side.
pub(crate) fn validate_request(
    request: &OrderRequest,
    known_symbol: bool,
    last_price: Option<f64>,
) -> Result<(), BrokerError> {
    if !(request.quantity.is_finite() && request.quantity > 0.0) {
        return Err(BrokerError::InvalidOrder(format!(
            "quantity must be positive, got {}",
            request.quantity
        )));
    }
    if !known_symbol {
        return Err(BrokerError::InvalidOrder(format!(
            "unknown symbol {}",
            request.symbol
        )));
    }
    let positive = |p: Option<f64>| p.is_some_and(|v| v.is_finite() && v > 0.0);
    match request.order_type {
        OrderType::Limit if !positive(request.price) => {
            return Err(BrokerError::InvalidOrder(
                "limit order requires a positive price".to_string(),
            ))
        }
        OrderType::Stop | OrderType::TakeProfit if !positive(request.stop_price) => {
            return Err(BrokerError::InvalidOrder(format!(
                "{:?} order requires a positive trigger price",
                request.order_type
            )))
        }
        _ => {}
    }

    let contingent = request.contingent;
    if contingent.is_empty() {
        return Ok(());
    }
    if request.parent_id.is_some() {
        return Err(BrokerError::InvalidOrder(
            "exit legs cannot carry their own contingent orders".to_string(),
        ));
    }
    if contingent.stop_loss.is_some() && !positive(contingent.stop_loss)
        || contingent.take_profit.is_some() && !positive(contingent.take_profit)
    {
        return Err(BrokerError::InvalidOrder(
            "contingent trigger prices must be positive".to_string(),
        ));
    }
    let Some(entry) = request.reference_price().or(last_price) else {
        return Ok(());
    };
    let direction = request.side.sign();
    if let Some(sl) = contingent.stop_loss {
        if (entry - sl) * direction <= 0.0 {
            return Err(BrokerError::InvalidOrder(format!(
                "stop-loss {} is not on the losing side of entry {}",
                sl, entry
            )));
        }
    }
    if let Some(tp) = contingent.take_profit {
        if (tp - entry) * direction <= 0.0 {
            return Err(BrokerError::InvalidOrder(format!(
                "take-profit {} is not on the winning side of entry {}",
                tp, entry
            )));
        }
    }
    Ok(())
}

impl Broker {
    /// Wrap a repository in the broker variant of the same mode.
    pub fn new(repository: Repository, config: &SessionConfig) -> Self {
        match repository {
            Repository::Backtest(repo) => Self::Backtest(BacktestBroker::new(
                repo,
                config.initial_balance,
                config.max_leverage,
                config.fee_rate,
            )),
            Repository::Live(repo) => Self::Live(LiveBroker::new(
                repo,
                config.timeframe,
                config.symbols(),
                config.initial_balance,
                config.max_leverage,
                config.fee_rate,
            )),
        }
    }

    pub fn mode(&self) -> TradingMode {
        match self {
            Self::Backtest(_) => TradingMode::Backtest,
            Self::Live(_) => TradingMode::Live,
        }
    }

    /// Load warm-up history. Runs once per session, before the first tick.
    pub async fn prepare_initial_data(&mut self, lookback: usize) -> Result<(), BrokerError> {
        match self {
            Self::Backtest(b) => b.prepare_initial_data(lookback),
            Self::Live(b) => b.prepare_initial_data(lookback).await,
        }
    }

    pub async fn update_data(&mut self) -> Result<(), BrokerError> {
        match self {
            Self::Backtest(b) => b.update_data(),
            Self::Live(b) => b.update_data().await,
        }
    }

    pub fn get_equity(&self) -> f64 {
        self.account().equity
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        match self {
            Self::Backtest(b) => b.get_position(symbol),
            Self::Live(b) => b.get_position(symbol),
        }
    }

    /// Last `lookback` candles (fewer when less history exists), oldest first.
    pub fn get_candles(&self, symbol: &str, lookback: usize) -> Vec<Candle> {
        match self {
            Self::Backtest(b) => b.get_candles(symbol, lookback),
            Self::Live(b) => b.get_candles(symbol, lookback),
        }
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        match self {
            Self::Backtest(b) => b.last_price(symbol),
            Self::Live(b) => b.last_price(symbol),
        }
    }

    pub async fn place_order(&mut self, request: OrderRequest) -> Result<Order, BrokerError> {
        match self {
            Self::Backtest(b) => b.place_order(&request),
            Self::Live(b) => b.place_order(&request).await,
        }
    }

    pub async fn cancel_order(&mut self, order_id: &str) -> Result<Order, BrokerError> {
        match self {
            Self::Backtest(b) => b.cancel_order(order_id),
            Self::Live(b) => b.cancel_order(order_id).await,
        }
    }

    /// Cancel every working order, optionally limited to one symbol.
    pub async fn cancel_all_orders(&mut self, symbol: Option<&str>) -> Result<Vec<Order>, BrokerError> {
        let ids: Vec<String> = self
            .open_orders()
            .into_iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .map(|o| o.id)
            .collect();
        let mut canceled = Vec::with_capacity(ids.len());
        for id in ids {
            canceled.push(self.cancel_order(&id).await?);
        }
        Ok(canceled)
    }

    /// Send a market order against the net position. `None` when already flat.
    pub async fn close_position(&mut self, symbol: &str) -> Result<Option<Order>, BrokerError> {
        let Some(position) = self.get_position(symbol) else {
            return Ok(None);
        };
        let side = if position.signed_quantity() > 0.0 {
            crate::exchange::OrderSide::Sell
        } else {
            crate::exchange::OrderSide::Buy
        };
        let request = OrderRequest::market(symbol, side, position.quantity).with_strategy("close_position");
        self.place_order(request).await.map(Some)
    }

    pub fn account(&self) -> &AccountState {
        match self {
            Self::Backtest(b) => b.account(),
            Self::Live(b) => b.account(),
        }
    }

    pub fn open_orders(&self) -> Vec<Order> {
        self.account().open_orders.values().cloned().collect()
    }

    pub fn symbols(&self) -> Vec<String> {
        match self {
            Self::Backtest(b) => b.symbols().to_vec(),
            Self::Live(b) => b.symbols().to_vec(),
        }
    }

    pub fn initial_balance(&self) -> f64 {
        match self {
            Self::Backtest(b) => b.initial_balance(),
            Self::Live(b) => b.initial_balance(),
        }
    }

    /// Simulated clock in backtests, wall clock live.
    pub fn current_time(&self) -> DateTime<Utc> {
        match self {
            Self::Backtest(b) => b.current_time().unwrap_or(DateTime::<Utc>::MIN_UTC),
            Self::Live(b) => b.current_time(),
        }
    }

    pub fn fills(&self) -> &[Fill] {
        match self {
            Self::Backtest(b) => b.fills(),
            Self::Live(b) => b.fills(),
        }
    }

    /// Order mutations since the last call, in the order they happened.
    pub fn drain_order_updates(&mut self) -> Vec<Order> {
        match self {
            Self::Backtest(b) => b.drain_order_updates(),
            Self::Live(b) => b.drain_order_updates(),
        }
    }

    pub fn as_backtest(&self) -> Option<&BacktestBroker> {
        match self {
            Self::Backtest(b) => Some(b),
            Self::Live(_) => None,
        }
    }

    pub fn as_backtest_mut(&mut self) -> Option<&mut BacktestBroker> {
        match self {
            Self::Backtest(b) => Some(b),
            Self::Live(_) => None,
        }
    }
}
