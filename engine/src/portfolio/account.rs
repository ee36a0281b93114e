//! Account state owned by a broker.
//!
//! Positions are netted per symbol. Realized P&L and fees are booked into `balance`;
//! `equity` is `balance` plus the unrealized P&L of every open position.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::exchange::{Order, OrderSide};
use crate::portfolio::{Position, PositionSide};

const QTY_EPSILON: f64 = 1e-12;

/// One executed order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: f64,
    pub price: f64,
    pub fee: f64,
    /// P&L realized by the part of the fill that reduced an existing position
    pub realized_pnl: f64,
    pub timestamp: DateTime<Utc>,
    pub strategy: Option<String>,
}

/// Balance, equity, positions and working orders of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountState {
    pub balance: f64,
    pub equity: f64,
    pub positions: BTreeMap<String, Position>,
    pub open_orders: BTreeMap<String, Order>,
    pub realized_pnl: f64,
    pub fees_paid: f64,
}

impl AccountState {
    pub fn new(initial_balance: f64) -> Self {
        Self {
            balance: initial_balance,
            equity: initial_balance,
            positions: BTreeMap::new(),
            open_orders: BTreeMap::new(),
            realized_pnl: 0.0,
            fees_paid: 0.0,
        }
    }

    /// Serialisable copy for status messages and persistence
    pub fn snapshot(&self) -> AccountState {
        self.clone()
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed net quantity for the symbol (0 when flat)
    pub fn net_quantity(&self, symbol: &str) -> f64 {
        self.positions
            .get(symbol)
            .map(Position::signed_quantity)
            .unwrap_or(0.0)
    }

    /// Book a fill against the net position of the order's symbol.
    pub fn apply_fill(
        &mut self,
        order: &Order,
        price: f64,
        fee_rate: f64,
        at: DateTime<Utc>,
    ) -> Fill {
        let fee = order.quantity * price * fee_rate;
        self.balance -= fee;
        self.fees_paid += fee;

        let incoming = order.signed_quantity();
        let mut realized = 0.0;
        let current = self.net_quantity(&order.symbol);

        if current.abs() < QTY_EPSILON || current.signum() == incoming.signum() {
            let total = current + incoming;
            let entry = match self.positions.get(&order.symbol) {
                Some(p) => (p.entry_price * p.quantity + price * order.quantity) / total.abs(),
                None => price,
            };
            let opened_at = self
                .positions
                .get(&order.symbol)
                .map(|p| p.opened_at)
                .unwrap_or(at);
            let mut position = Position::new(order.symbol.clone(), side_of(total), total.abs(), entry, opened_at);
            position.update_price(price);
            self.positions.insert(order.symbol.clone(), position);
        } else if let Some(existing) = self.positions.remove(&order.symbol) {
            let closing = existing.quantity.min(order.quantity);
            realized = (price - existing.entry_price) * closing * existing.side.sign();
            self.balance += realized;
            self.realized_pnl += realized;

            let remaining = current + incoming;
            if remaining.abs() >= QTY_EPSILON {
                let flipped = remaining.signum() != current.signum();
                let mut position = if flipped {
                    Position::new(order.symbol.clone(), side_of(remaining), remaining.abs(), price, at)
                } else {
                    Position {
                        quantity: remaining.abs(),
                        ..existing
                    }
                };
                position.update_price(price);
                self.positions.insert(order.symbol.clone(), position);
            }
        }

        self.open_orders.remove(&order.id);
        self.recompute();

        Fill {
            order_id: order.id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            quantity: order.quantity,
            price,
            fee,
            realized_pnl: realized,
            timestamp: at,
            strategy: order.strategy.clone(),
        }
    }

    /// Mark the symbol's position to `price`
    pub fn mark(&mut self, symbol: &str, price: f64) {
        if let Some(position) = self.positions.get_mut(symbol) {
            position.update_price(price);
        }
    }

    /// Recompute equity from balance and unrealized P&L
    pub fn recompute(&mut self) {
        let unrealized: f64 = self.positions.values().map(|p| p.unrealized_pnl).sum();
        self.equity = self.balance + unrealized;
    }
}

fn side_of(signed: f64) -> PositionSide {
    if signed >= 0.0 {
        PositionSide::Long
    } else {
        PositionSide::Short
    }
}
