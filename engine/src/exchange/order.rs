//! Orders as placed by strategies and tracked by the broker

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::data::Candle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    Market,
    Limit,
    /// Stop order, becomes a market order once price moves through the trigger
    /// against the order (up for buys, down for sells)
    Stop,
    /// Take-profit order, becomes a market order once price moves through the trigger
    /// in the order's favour (down for buys, up for sells)
    TakeProfit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

/// Lifecycle of an order; everything but `Open` is terminal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Filled, canceled and rejected orders never change again
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Open)
    }
}

/// Exit triggers attached to an entry order. Each one becomes a reduce-only order on
/// the opposite side once the entry fills; whichever executes first cancels the other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Contingent {
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
}

impl Contingent {
    pub fn is_empty(&self) -> bool {
        self.stop_loss.is_none() && self.take_profit.is_none()
    }
}

/// What a strategy asks the broker to place
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price (limit orders only)
    pub price: Option<f64>,
    /// Trigger price (stop orders only)
    pub stop_price: Option<f64>,
    /// Originating strategy, used as the client order tag
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Contingent::is_empty")]
    pub contingent: Contingent,
    /// Entry order this exit leg belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<String>, side: OrderSide, quantity: f64) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
            stop_price: None,
            strategy: None,
            contingent: Contingent::default(),
            parent_id: None,
        }
    }

    pub fn limit(symbol: impl Into<String>, side: OrderSide, quantity: f64, price: f64) -> Self {
        Self {
            price: Some(price),
            order_type: OrderType::Limit,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn stop(symbol: impl Into<String>, side: OrderSide, quantity: f64, stop_price: f64) -> Self {
        Self {
            stop_price: Some(stop_price),
            order_type: OrderType::Stop,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn take_profit(symbol: impl Into<String>, side: OrderSide, quantity: f64, trigger: f64) -> Self {
        Self {
            stop_price: Some(trigger),
            order_type: OrderType::TakeProfit,
            ..Self::market(symbol, side, quantity)
        }
    }

    pub fn with_strategy(mut self, strategy: impl Into<String>) -> Self {
        self.strategy = Some(strategy.into());
        self
    }

    /// Exit with a stop at `trigger` once this entry fills
    pub fn with_stop_loss(mut self, trigger: f64) -> Self {
        self.contingent.stop_loss = Some(trigger);
        self
    }

    /// Exit with a take-profit at `trigger` once this entry fills
    pub fn with_take_profit(mut self, trigger: f64) -> Self {
        self.contingent.take_profit = Some(trigger);
        self
    }

    /// Price the order would trade at for margin purposes, if it carries one
    pub fn reference_price(&self) -> Option<f64> {
        match self.order_type {
            OrderType::Market => None,
            OrderType::Limit => self.price,
            OrderType::Stop | OrderType::TakeProfit => self.stop_price,
        }
    }
}

/// An order owned by the broker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: f64,
    /// Limit price
    pub price: Option<f64>,
    /// Stop trigger price
    pub stop_price: Option<f64>,
    pub status: OrderStatus,
    /// Set once a stop order's trigger has traded
    #[serde(default)]
    pub triggered: bool,
    /// Originating strategy
    pub strategy: Option<String>,
    #[serde(default, skip_serializing_if = "Contingent::is_empty")]
    pub contingent: Contingent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Execution price once filled
    pub filled_price: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fill time
    pub filled_at: Option<DateTime<Utc>>,
}

impl Order {
    /// Create a new open order from a request
    pub fn from_request(id: String, request: &OrderRequest, now: DateTime<Utc>) -> Self {
        Self {
            id,
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            stop_price: request.stop_price,
            status: OrderStatus::Open,
            triggered: false,
            strategy: request.strategy.clone(),
            contingent: request.contingent,
            parent_id: request.parent_id.clone(),
            filled_price: None,
            created_at: now,
            updated_at: now,
            filled_at: None,
        }
    }

    pub fn is_filled(&self) -> bool {
        self.status == OrderStatus::Filled
    }

    /// Check if order is still working
    pub fn is_open(&self) -> bool {
        self.status == OrderStatus::Open
    }

    /// Signed quantity: positive for buys, negative for sells
    pub fn signed_quantity(&self) -> f64 {
        self.side.sign() * self.quantity
    }

    pub fn mark_filled(&mut self, price: f64, at: DateTime<Utc>) {
        self.status = OrderStatus::Filled;
        self.filled_price = Some(price);
        self.filled_at = Some(at);
        self.updated_at = at;
    }

    /// Whether `bar` reached this order's trigger. Only one side of the bar is checked,
    /// so a bar that gaps through the trigger counts: buy stops and sell take-profits
    /// fire on `high >= trigger`, sell stops and buy take-profits on `low <= trigger`.
    pub fn trigger_reached(&self, bar: &Candle) -> bool {
        let Some(trigger) = self.stop_price else {
            return false;
        };
        match (self.order_type, self.side) {
            (OrderType::Stop, OrderSide::Buy) | (OrderType::TakeProfit, OrderSide::Sell) => {
                bar.high >= trigger
            }
            (OrderType::Stop, OrderSide::Sell) | (OrderType::TakeProfit, OrderSide::Buy) => {
                bar.low <= trigger
            }
            _ => false,
        }
    }

    /// Exit legs to place once this entry has filled
    pub fn contingent_requests(&self) -> Vec<OrderRequest> {
        let exit = self.side.opposite();
        let legs = [
            self.contingent
                .stop_loss
                .map(|p| OrderRequest::stop(self.symbol.clone(), exit, self.quantity, p)),
            self.contingent
                .take_profit
                .map(|p| OrderRequest::take_profit(self.symbol.clone(), exit, self.quantity, p)),
        ];
        legs.into_iter()
            .flatten()
            .map(|mut leg| {
                leg.strategy = self.strategy.clone();
                leg.parent_id = Some(self.id.clone());
                leg
            })
            .collect()
    }

    pub fn mark_canceled(&mut self, at: DateTime<Utc>) {
        self.status = OrderStatus::Canceled;
        self.updated_at = at;
    }
}
