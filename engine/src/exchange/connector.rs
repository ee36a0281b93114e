//! Boundary to the external exchange-connector library.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::data::{Candle, Timeframe};
use crate::exchange::{Order, OrderRequest};

/// Errors a connector reports, already classified for the retry layer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConnectorError {
    /// Network failures, timeouts, rate limits. Safe to retry.
    #[error("transient exchange error: {0}")]
    Transient(String),
    #[error("order not found: {0}")]
    OrderNotFound(String),
    /// Exchange refused the request; retrying will not help.
    #[error("rejected by exchange: {0}")]
    Rejected(String),
}

impl ConnectorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

pub type ConnectorResult<T> = Result<T, ConnectorError>;

/// Exchange operations used by live repositories.
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Connector name used for logging.
    fn name(&self) -> &str;

    /// Closed and forming candles in ascending order. `since = None` returns the latest
    /// `limit` candles, otherwise the first `limit` candles at or after `since`.
    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ConnectorResult<Vec<Candle>>;

    /// Every order the exchange knows for the symbol, open or not.
    async fn fetch_orders(&self, symbol: &str) -> ConnectorResult<Vec<Order>>;

    async fn create_order(&self, request: &OrderRequest) -> ConnectorResult<Order>;

    /// Cancel an open order. Terminal or unknown orders yield `OrderNotFound`.
    async fn cancel_order(&self, order_id: &str) -> ConnectorResult<Order>;

    /// Free quote-currency balance.
    async fn fetch_balance(&self) -> ConnectorResult<f64>;
}
