//! `SeaORM` Entity, @generated manually

use sea_orm::entity::prelude::*;

/// Latest known state of every order a worker placed, one row per `(user_id, symbol, order_id)`
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "order_history")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: u64,
    pub user_id: String,
    pub symbol: String,
    pub order_id: String,
    pub side: String, // "buy" or "sell"
    pub order_type: String, // "market", "limit", "stop", "take_profit"
    pub status: String, // "open", "filled", "canceled", "rejected"
    #[sea_orm(column_type = "Double")]
    pub quantity: f64,
    #[sea_orm(column_type = "Double", nullable)]
    pub price: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub stop_price: Option<f64>,
    #[sea_orm(column_type = "Double", nullable)]
    pub filled_price: Option<f64>,
    #[sea_orm(column_type = "Text", nullable)]
    pub strategy: Option<String>,
    pub created_at: DateTimeUtc,
    pub updated_at: DateTimeUtc,
    pub filled_at: Option<DateTimeUtc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
