//! Live broker: candle cache refreshed by polling, order state reconciled with the exchange.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::validate_request;
use crate::data::{Candle, CandleSeries, Timeframe};
use crate::error::{BrokerError, RepositoryError};
use crate::exchange::{Order, OrderRequest, OrderStatus};
use crate::portfolio::{AccountState, Fill, Position, RiskManager};
use crate::repository::LiveRepository;

/// Bars fetched per symbol on every refresh; merged into the cache.
const REFRESH_BARS: usize = 5;

pub struct LiveBroker {
    repository: LiveRepository,
    timeframe: Timeframe,
    symbols: Vec<String>,
    account: AccountState,
    initial_balance: f64,
    risk: RiskManager,
    fee_rate: f64,
    cache: BTreeMap<String, CandleSeries>,
    max_candles: usize,
    prepared: bool,
    last_prices: BTreeMap<String, f64>,
    fills: Vec<Fill>,
    order_updates: Vec<Order>,
}

impl LiveBroker {
    pub fn new(
        repository: LiveRepository,
        timeframe: Timeframe,
        symbols: Vec<String>,
        initial_balance: f64,
        max_leverage: f64,
        fee_rate: f64,
    ) -> Self {
        Self {
            repository,
            timeframe,
            symbols,
            account: AccountState::new(initial_balance),
            initial_balance,
            risk: RiskManager::new(max_leverage),
            fee_rate,
            cache: BTreeMap::new(),
            max_candles: 1,
            prepared: false,
            last_prices: BTreeMap::new(),
            fills: Vec::new(),
            order_updates: Vec::new(),
        }
    }

    /// One-shot warm-up: load `lookback` candles per symbol and clear orders left over
    /// from an earlier session.
    pub async fn prepare_initial_data(&mut self, lookback: usize) -> Result<(), BrokerError> {
        if self.prepared {
            return Err(BrokerError::AlreadyPrepared);
        }
        let lookback = lookback.max(1);

        for symbol in self.symbols.clone() {
            let candles = self
                .repository
                .fetch_ohlcv(&symbol, self.timeframe, None, lookback)
                .await?;
            if candles.len() < lookback {
                return Err(BrokerError::InsufficientHistory {
                    symbol,
                    needed: lookback,
                    available: candles.len(),
                });
            }
            if let Some(last) = candles.last() {
                self.last_prices.insert(symbol.clone(), last.close);
            }
            self.cache.insert(symbol.clone(), CandleSeries::from_vec(candles));

            let stale: Vec<String> = self
                .repository
                .fetch_orders(&symbol)
                .await?
                .into_values()
                .filter(Order::is_open)
                .map(|o| o.id)
                .collect();
            for order_id in stale {
                match self.repository.cancel_order(&order_id).await {
                    Ok(_) | Err(RepositoryError::OrderNotFound(_)) => {
                        info!(order_id = %order_id, symbol = %symbol, "Canceled stale order")
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        let balance = self.repository.fetch_balance().await?;
        info!(
            connector = self.repository.connector_name(),
            exchange_balance = balance,
            lookback,
            "Live data prepared"
        );
        self.max_candles = lookback;
        self.prepared = true;
        Ok(())
    }

    /// Refresh the latest bars, reconcile working orders and mark positions.
    pub async fn update_data(&mut self) -> Result<(), BrokerError> {
        for symbol in self.symbols.clone() {
            let batch = self
                .repository
                .fetch_ohlcv(&symbol, self.timeframe, None, REFRESH_BARS.min(self.max_candles).max(1))
                .await?;
            let series = self.cache.entry(symbol.clone()).or_default();
            series.merge(batch);
            series.truncate_to(self.max_candles);
            if let Some(last) = series.last() {
                self.last_prices.insert(symbol.clone(), last.close);
            }

            if self.account.open_orders.values().any(|o| o.symbol == symbol) {
                self.reconcile(&symbol).await?;
            }
            if let Some(price) = self.last_prices.get(&symbol).copied() {
                self.account.mark(&symbol, price);
            }
        }
        self.account.recompute();
        Ok(())
    }

    async fn reconcile(&mut self, symbol: &str) -> Result<(), BrokerError> {
        let remote = self.repository.fetch_orders(symbol).await?;
        let tracked: Vec<String> = self
            .account
            .open_orders
            .values()
            .filter(|o| o.symbol == symbol)
            .map(|o| o.id.clone())
            .collect();

        for order_id in tracked {
            // an exit leg retired by an earlier fill in this pass
            if !self.account.open_orders.contains_key(&order_id) {
                continue;
            }
            let Some(order) = remote.get(&order_id) else {
                continue;
            };
            match order.status {
                OrderStatus::Open => {
                    self.account.open_orders.insert(order_id, order.clone());
                }
                OrderStatus::Filled => self.on_filled(order.clone()).await?,
                OrderStatus::Canceled | OrderStatus::Rejected => {
                    warn!(order_id = %order.id, status = ?order.status, "Order closed by exchange");
                    self.account.open_orders.remove(&order_id);
                    self.order_updates.push(order.clone());
                }
            }
        }
        Ok(())
    }

    /// Book a fill reported by the exchange, then place or retire exit legs.
    ///
    /// Without a fill price or a last price the order stays tracked as open, so the next
    /// reconcile books it once a price is known.
    async fn on_filled(&mut self, order: Order) -> Result<(), BrokerError> {
        let Some(price) = order
            .filled_price
            .or_else(|| self.last_prices.get(&order.symbol).copied())
        else {
            warn!(order_id = %order.id, symbol = %order.symbol, "Fill without a known price, deferring");
            self.account.open_orders.insert(order.id.clone(), order);
            return Ok(());
        };
        let at = order.filled_at.unwrap_or_else(Utc::now);
        let fill = self.account.apply_fill(&order, price, self.fee_rate, at);
        info!(order_id = %order.id, symbol = %order.symbol, price, "Order filled");
        self.fills.push(fill);
        self.order_updates.push(order.clone());
        self.settle_contingents(&order).await
    }

    async fn settle_contingents(&mut self, filled: &Order) -> Result<(), BrokerError> {
        if filled.parent_id.is_none() {
            for leg in filled.contingent_requests() {
                let placed = self.repository.create_order(&leg).await?;
                info!(order_id = %placed.id, parent = %filled.id, kind = ?placed.order_type, "Exit leg placed");
                self.account.open_orders.insert(placed.id.clone(), placed.clone());
                self.order_updates.push(placed);
            }
        }

        let flat = self.account.position(&filled.symbol).is_none();
        let obsolete: Vec<String> = self
            .account
            .open_orders
            .values()
            .filter(|o| o.symbol == filled.symbol)
            .filter(|o| match (&o.parent_id, &filled.parent_id) {
                (Some(parent), Some(executed)) if parent == executed => true,
                (Some(_), _) => flat,
                (None, _) => false,
            })
            .map(|o| o.id.clone())
            .collect();
        for order_id in obsolete {
            match self.repository.cancel_order(&order_id).await {
                Ok(canceled) => self.order_updates.push(canceled),
                Err(RepositoryError::OrderNotFound(_)) => {
                    debug!(order_id = %order_id, "Exit leg already closed")
                }
                Err(e) => return Err(e.into()),
            }
            self.account.open_orders.remove(&order_id);
        }
        Ok(())
    }

    pub fn get_candles(&self, symbol: &str, lookback: usize) -> Vec<Candle> {
        self.cache
            .get(symbol)
            .map(|series| series.tail(lookback).to_vec())
            .unwrap_or_default()
    }

    pub async fn place_order(&mut self, request: &OrderRequest) -> Result<Order, BrokerError> {
        validate_request(
            request,
            self.symbols.contains(&request.symbol),
            self.last_price(&request.symbol),
        )?;
        self.risk
            .check_order(&self.account, request, &self.last_prices)?;

        let order = self.repository.create_order(request).await?;
        debug!(order_id = %order.id, symbol = %order.symbol, status = ?order.status, "Order placed");
        if order.is_filled() {
            self.on_filled(order.clone()).await?;
        } else {
            self.account.open_orders.insert(order.id.clone(), order.clone());
            self.order_updates.push(order.clone());
        }
        self.account.recompute();
        Ok(order)
    }

    pub async fn cancel_order(&mut self, order_id: &str) -> Result<Order, BrokerError> {
        let order = self.repository.cancel_order(order_id).await?;
        self.account.open_orders.remove(order_id);
        self.order_updates.push(order.clone());
        Ok(order)
    }

    pub fn account(&self) -> &AccountState {
        &self.account
    }

    pub fn get_position(&self, symbol: &str) -> Option<Position> {
        self.account.position(symbol).cloned()
    }

    pub fn last_price(&self, symbol: &str) -> Option<f64> {
        self.last_prices.get(symbol).copied()
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn current_time(&self) -> DateTime<Utc> {
        Utc::now()
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn drain_order_updates(&mut self) -> Vec<Order> {
        std::mem::take(&mut self.order_updates)
    }
}
