//! Net per-symbol exposure, marked to the last close

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of a net position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn sign(&self) -> f64 {
        match self {
            Self::Long => 1.0,
            Self::Short => -1.0,
        }
    }
}

/// Net position in one symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    /// Absolute quantity
    pub quantity: f64,
    /// Average entry price
    pub entry_price: f64,
    /// Last mark price
    pub current_price: f64,
    /// Unrealized P&L at the last mark
    pub unrealized_pnl: f64,
    /// Time the position was opened
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Opened by a fill at `entry_price`
    pub fn new(
        symbol: String,
        side: PositionSide,
        quantity: f64,
        entry_price: f64,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol,
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: 0.0,
            opened_at,
        }
    }

    /// Update current price and recalculate P&L
    pub fn update_price(&mut self, price: f64) {
        self.current_price = price;
        self.unrealized_pnl = self.pnl_at(price);
    }

    /// P&L of the whole position if closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// Positive for longs, negative for shorts
    pub fn signed_quantity(&self) -> f64 {
        self.quantity * self.side.sign()
    }

    /// Get position value at the last mark
    pub fn value(&self) -> f64 {
        self.current_price * self.quantity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_profits_when_price_falls() {
        let mut position = Position::new("ETH/USDT".to_string(), PositionSide::Short, 2.0, 100.0, Utc::now());
        position.update_price(90.0);
        assert_eq!(position.unrealized_pnl, 20.0);
        assert_eq!(position.signed_quantity(), -2.0);
    }
}
