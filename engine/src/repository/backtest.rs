//! Backtest repository: preloaded candles, simulated clock, deterministic order ids.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use super::RepositoryResult;
use crate::data::{Candle, CandleSeries, DataStorage, Timeframe};
use crate::error::RepositoryError;
use crate::exchange::{Order, OrderRequest, OrderStatus};

pub struct BacktestRepository {
    storage: DataStorage,
    timeframe: Timeframe,
    symbols: Vec<String>,
    clock: Option<DateTime<Utc>>,
    start: Option<DateTime<Utc>>,
    orders: BTreeMap<String, Order>,
    next_id: u64,
}

impl BacktestRepository {
    pub fn new(timeframe: Timeframe) -> Self {
        Self {
            storage: DataStorage::new(),
            timeframe,
            symbols: Vec::new(),
            clock: None,
            start: None,
            orders: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Register the dataset for a symbol
    pub fn with_series(mut self, symbol: &str, series: CandleSeries) -> Self {
        self.storage.insert_series(symbol, self.timeframe, series);
        if !self.symbols.iter().any(|s| s == symbol) {
            self.symbols.push(symbol.to_string());
        }
        self
    }

    /// First bar the session trades on; earlier bars only serve as warm-up history
    pub fn with_start(mut self, start: Option<DateTime<Utc>>) -> Self {
        self.start = start;
        self
    }

    pub fn start(&self) -> Option<DateTime<Utc>> {
        self.start
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn symbols(&self) -> &[String] {
        &self.symbols
    }

    pub fn series(&self, symbol: &str) -> Option<&CandleSeries> {
        self.storage.get(symbol, self.timeframe)
    }

    /// Every bar timestamp across all symbols, ascending
    pub fn timeline(&self) -> Vec<DateTime<Utc>> {
        let stamps: BTreeSet<DateTime<Utc>> = self
            .symbols
            .iter()
            .filter_map(|s| self.series(s))
            .flat_map(|series| series.candles().iter().map(|c| c.timestamp))
            .collect();
        stamps.into_iter().collect()
    }

    pub fn clock(&self) -> Option<DateTime<Utc>> {
        self.clock
    }

    /// Advance the simulated clock. Data after the clock is never served.
    pub fn set_clock(&mut self, ts: DateTime<Utc>) {
        self.clock = Some(ts);
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> RepositoryResult<Vec<Candle>> {
        if timeframe != self.timeframe {
            return Err(RepositoryError::Rejected(format!(
                "dataset is {}, requested {}",
                self.timeframe, timeframe
            )));
        }
        let series = self
            .series(symbol)
            .ok_or_else(|| RepositoryError::UnknownSymbol(symbol.to_string()))?;
        let Some(clock) = self.clock else {
            return Ok(Vec::new());
        };
        let visible = series.up_to(clock);
        let candles = match since {
            None => visible[visible.len().saturating_sub(limit)..].to_vec(),
            Some(ts) => visible
                .iter()
                .filter(|c| c.timestamp >= ts)
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(candles)
    }

    pub fn fetch_orders(&self, symbol: &str) -> BTreeMap<String, Order> {
        self.orders
            .iter()
            .filter(|(_, o)| o.symbol == symbol)
            .map(|(id, o)| (id.clone(), o.clone()))
            .collect()
    }

    pub fn create_order(&mut self, request: &OrderRequest) -> RepositoryResult<Order> {
        if self.series(&request.symbol).is_none() {
            return Err(RepositoryError::UnknownSymbol(request.symbol.clone()));
        }
        self.next_id += 1;
        let id = format!("bt-{:09}", self.next_id);
        let order = Order::from_request(id.clone(), request, self.now());
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    pub fn cancel_order(&mut self, order_id: &str) -> RepositoryResult<Order> {
        let now = self.now();
        match self.orders.get_mut(order_id) {
            Some(order) if order.is_open() => {
                order.mark_canceled(now);
                Ok(order.clone())
            }
            _ => Err(RepositoryError::OrderNotFound(order_id.to_string())),
        }
    }

    /// Open orders across all symbols, in id (creation) order
    pub fn open_orders(&self) -> Vec<Order> {
        self.orders
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .cloned()
            .collect()
    }

    /// Mark an open order filled at `price` on the current clock.
    pub fn fill_order(&mut self, order_id: &str, price: f64) -> RepositoryResult<Order> {
        let now = self.now();
        match self.orders.get_mut(order_id) {
            Some(order) if order.is_open() => {
                order.mark_filled(price, now);
                Ok(order.clone())
            }
            _ => Err(RepositoryError::OrderNotFound(order_id.to_string())),
        }
    }

    pub fn order(&self, order_id: &str) -> Option<&Order> {
        self.orders.get(order_id)
    }

    /// Arm a stop or take-profit order whose trigger traded on the current bar.
    pub fn mark_triggered(&mut self, order_id: &str) -> RepositoryResult<Order> {
        let now = self.now();
        match self.orders.get_mut(order_id) {
            Some(order) if order.is_open() => {
                order.triggered = true;
                order.updated_at = now;
                Ok(order.clone())
            }
            _ => Err(RepositoryError::OrderNotFound(order_id.to_string())),
        }
    }
}
