//! Relational persistence for one worker's own rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::prelude::*;
use sea_orm::ActiveValue;
use serde::Serialize;
use tracing::debug;
use trader_engine::exchange::Order;
use trader_engine::portfolio::AccountState;

use crate::entity::{account_snapshots, order_history};

/// Writes order history and account snapshots for a single user
pub struct SessionStore {
    db: Arc<DatabaseConnection>,
    user_id: String,
}

fn label<T: Serialize>(value: &T) -> String {
    serde_json::to_value(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

impl SessionStore {
    pub fn new(db: Arc<DatabaseConnection>, user_id: impl Into<String>) -> Self {
        Self {
            db,
            user_id: user_id.into(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Insert or update the row keyed by `(user_id, symbol, order_id)`
    pub async fn record_order(&self, order: &Order) -> Result<(), DbErr> {
        let existing = order_history::Entity::find()
            .filter(order_history::Column::UserId.eq(self.user_id.as_str()))
            .filter(order_history::Column::Symbol.eq(order.symbol.as_str()))
            .filter(order_history::Column::OrderId.eq(order.id.as_str()))
            .one(self.db.as_ref())
            .await?;

        let mut row = order_history::ActiveModel {
            user_id: ActiveValue::Set(self.user_id.clone()),
            symbol: ActiveValue::Set(order.symbol.clone()),
            order_id: ActiveValue::Set(order.id.clone()),
            side: ActiveValue::Set(label(&order.side)),
            order_type: ActiveValue::Set(label(&order.order_type)),
            status: ActiveValue::Set(label(&order.status)),
            quantity: ActiveValue::Set(order.quantity),
            price: ActiveValue::Set(order.price),
            stop_price: ActiveValue::Set(order.stop_price),
            filled_price: ActiveValue::Set(order.filled_price),
            strategy: ActiveValue::Set(order.strategy.clone()),
            created_at: ActiveValue::Set(order.created_at),
            updated_at: ActiveValue::Set(order.updated_at),
            filled_at: ActiveValue::Set(order.filled_at),
            ..Default::default()
        };

        match existing {
            Some(model) => {
                row.id = ActiveValue::Unchanged(model.id);
                order_history::Entity::update(row).exec(self.db.as_ref()).await?;
            }
            None => {
                order_history::Entity::insert(row).exec(self.db.as_ref()).await?;
            }
        }
        debug!(user_id = %self.user_id, order_id = %order.id, status = ?order.status, "Order persisted");
        Ok(())
    }

    pub async fn save_snapshot(&self, taken_at: DateTime<Utc>, account: &AccountState) -> Result<(), DbErr> {
        let state = serde_json::to_string(account).map_err(|e| DbErr::Custom(e.to_string()))?;
        let row = account_snapshots::ActiveModel {
            user_id: ActiveValue::Set(self.user_id.clone()),
            taken_at: ActiveValue::Set(taken_at),
            balance: ActiveValue::Set(account.balance),
            equity: ActiveValue::Set(account.equity),
            realized_pnl: ActiveValue::Set(account.realized_pnl),
            open_positions: ActiveValue::Set(account.positions.len() as i32),
            open_orders: ActiveValue::Set(account.open_orders.len() as i32),
            state: ActiveValue::Set(state),
            ..Default::default()
        };
        account_snapshots::Entity::insert(row).exec(self.db.as_ref()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trader_engine::exchange::{OrderSide, OrderStatus, OrderType};

    #[test]
    fn enum_labels_match_the_wire_names() {
        assert_eq!(label(&OrderSide::Buy), "buy");
        assert_eq!(label(&OrderType::Stop), "stop");
        assert_eq!(label(&OrderType::TakeProfit), "take_profit");
        assert_eq!(label(&OrderStatus::Canceled), "canceled");
    }
}
