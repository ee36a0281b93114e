//! Live repository: exchange connector calls with timeout and bounded exponential backoff.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use super::RepositoryResult;
use crate::config::RetryConfig;
use crate::data::{Candle, Timeframe};
use crate::error::RepositoryError;
use crate::exchange::{ConnectorError, ExchangeConnector, Order, OrderRequest};

pub struct LiveRepository {
    connector: Arc<dyn ExchangeConnector>,
    retry: RetryConfig,
}

impl LiveRepository {
    pub fn new(connector: Arc<dyn ExchangeConnector>, retry: RetryConfig) -> Self {
        Self { connector, retry }
    }

    pub fn connector_name(&self) -> &str {
        self.connector.name()
    }

    /// One call bounded by the configured timeout. Timeouts count as transient.
    async fn attempt<T, Fut>(&self, fut: Fut) -> Result<T, ConnectorError>
    where
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        match tokio::time::timeout(self.retry.call_timeout(), fut).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Transient(format!(
                "call timed out after {}ms",
                self.retry.call_timeout_ms
            ))),
        }
    }

    /// Run `call` until it succeeds, fails permanently or the attempt budget is spent.
    async fn with_retry<T, F, Fut>(&self, operation: &str, call: F) -> RepositoryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, ConnectorError>>,
    {
        let mut attempt = 1;
        loop {
            match self.attempt(call()).await {
                Ok(value) => return Ok(value),
                Err(ConnectorError::Transient(message)) => {
                    if attempt >= self.retry.max_attempts {
                        warn!(operation, attempts = attempt, error = %message, "Retry budget exhausted");
                        return Err(RepositoryError::Transient {
                            attempts: attempt,
                            message,
                        });
                    }
                    let delay = self.retry.delay_for(attempt);
                    debug!(operation, attempt, delay_ms = delay.as_millis() as u64, error = %message, "Retrying exchange call");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(other) => return Err(map_permanent(other)),
            }
        }
    }

    pub async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> RepositoryResult<Vec<Candle>> {
        let mut candles = self
            .with_retry("fetch_ohlcv", || {
                self.connector.fetch_ohlcv(symbol, timeframe, since, limit)
            })
            .await?;
        // connectors are not trusted to sort or deduplicate
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        Ok(candles)
    }

    pub async fn fetch_orders(&self, symbol: &str) -> RepositoryResult<BTreeMap<String, Order>> {
        let orders = self
            .with_retry("fetch_orders", || self.connector.fetch_orders(symbol))
            .await?;
        Ok(orders.into_iter().map(|o| (o.id.clone(), o)).collect())
    }

    /// Single attempt. A timed-out create may already be live on the exchange.
    pub async fn create_order(&self, request: &OrderRequest) -> RepositoryResult<Order> {
        match self.attempt(self.connector.create_order(request)).await {
            Ok(order) => Ok(order),
            Err(ConnectorError::Transient(message)) => Err(RepositoryError::Transient {
                attempts: 1,
                message,
            }),
            Err(other) => Err(map_permanent(other)),
        }
    }

    pub async fn cancel_order(&self, order_id: &str) -> RepositoryResult<Order> {
        self.with_retry("cancel_order", || self.connector.cancel_order(order_id))
            .await
    }

    pub async fn fetch_balance(&self) -> RepositoryResult<f64> {
        self.with_retry("fetch_balance", || self.connector.fetch_balance())
            .await
    }
}

fn map_permanent(error: ConnectorError) -> RepositoryError {
    match error {
        ConnectorError::OrderNotFound(id) => RepositoryError::OrderNotFound(id),
        ConnectorError::Rejected(reason) => RepositoryError::Rejected(reason),
        ConnectorError::Transient(message) => RepositoryError::Transient {
            attempts: 1,
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::CandleSeries;
    use crate::exchange::{OrderSide, PaperConnector};
    use chrono::TimeZone;
    use std::time::Duration;

    fn paper() -> Arc<PaperConnector> {
        let candles = (0..5)
            .map(|i| Candle::new(Utc.timestamp_opt(i * 60, 0).unwrap(), 10.0, 11.0, 9.0, 10.0, 1.0))
            .collect();
        Arc::new(PaperConnector::new(
            BTreeMap::from([("SYM".to_string(), CandleSeries::from_vec(candles))]),
            Timeframe::M1,
            1_000.0,
            4,
            Duration::from_secs(60),
        ))
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_failures_within_budget() {
        let connector = paper();
        connector.fail_next(2);
        let repo = LiveRepository::new(connector, RetryConfig::default());
        let candles = repo.fetch_ohlcv("SYM", Timeframe::M1, None, 3).await.unwrap();
        assert_eq!(candles.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_transient_error_once_budget_is_spent() {
        let connector = paper();
        connector.fail_next(10);
        let retry = RetryConfig {
            max_attempts: 3,
            ..RetryConfig::default()
        };
        let repo = LiveRepository::new(connector, retry);
        let err = repo.fetch_balance().await.unwrap_err();
        assert!(matches!(err, RepositoryError::Transient { attempts: 3, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn create_order_is_attempted_once() {
        let connector = paper();
        connector.fail_next(1);
        let repo = LiveRepository::new(connector.clone(), RetryConfig::default());
        let request = OrderRequest::market("SYM", OrderSide::Buy, 1.0);
        assert!(matches!(
            repo.create_order(&request).await,
            Err(RepositoryError::Transient { attempts: 1, .. })
        ));
        assert!(repo.create_order(&request).await.is_ok());
    }
}
