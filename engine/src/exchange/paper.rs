//! Paper trading connector.
//!
//! Replays candle datasets in wall-clock time so the live path can run without an
//! exchange account. A warm-up prefix is visible immediately, then one more bar is
//! revealed every `bar_interval`. Market orders fill at the latest visible close,
//! resting orders are matched against bars revealed after they were placed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::data::{Candle, CandleSeries, Timeframe};
use crate::exchange::{
    ConnectorError, ConnectorResult, ExchangeConnector, Order, OrderRequest, OrderSide, OrderType,
};

#[derive(Debug, Default)]
struct PaperState {
    orders: BTreeMap<String, Order>,
    /// order id -> number of bars already matched against it
    matched_upto: BTreeMap<String, usize>,
    next_id: u64,
    cash: f64,
}

/// In-process exchange simulator for live sessions
pub struct PaperConnector {
    markets: BTreeMap<String, CandleSeries>,
    timeframe: Timeframe,
    warmup: usize,
    bar_interval: Duration,
    started: Instant,
    state: Mutex<PaperState>,
    pending_failures: AtomicU32,
}

impl PaperConnector {
    pub fn new(
        markets: BTreeMap<String, CandleSeries>,
        timeframe: Timeframe,
        initial_cash: f64,
        warmup: usize,
        bar_interval: Duration,
    ) -> Self {
        info!(
            markets = markets.len(),
            warmup,
            bar_interval_ms = bar_interval.as_millis() as u64,
            "Paper connector ready"
        );
        Self {
            markets,
            timeframe,
            warmup,
            bar_interval,
            started: Instant::now(),
            state: Mutex::new(PaperState {
                cash: initial_cash,
                ..PaperState::default()
            }),
            pending_failures: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: u32) {
        self.pending_failures.store(n, Ordering::SeqCst);
    }

    fn take_failure(&self) -> ConnectorResult<()> {
        let injected = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(ConnectorError::Transient("connection reset".to_string()))
        } else {
            Ok(())
        }
    }

    fn series(&self, symbol: &str) -> ConnectorResult<&CandleSeries> {
        self.markets
            .get(symbol)
            .ok_or_else(|| ConnectorError::Rejected(format!("unknown symbol {}", symbol)))
    }

    /// Candles revealed so far
    fn visible<'a>(&self, series: &'a CandleSeries) -> &'a [Candle] {
        let interval = self.bar_interval.as_millis().max(1);
        let revealed = (self.started.elapsed().as_millis() / interval) as usize;
        let len = (self.warmup + 1 + revealed).min(series.len());
        &series.candles()[..len]
    }

    /// Match resting orders bar by bar, in time order across orders, so an exit leg that
    /// executes first cancels its sibling before the sibling sees the next bar.
    fn match_resting(&self, state: &mut PaperState, symbol: &str, bars: &[Candle]) {
        let PaperState {
            orders,
            matched_upto,
            cash,
            ..
        } = state;
        let resting: Vec<String> = orders
            .values()
            .filter(|o| o.symbol == symbol && o.is_open())
            .map(|o| o.id.clone())
            .collect();

        for (index, bar) in bars.iter().enumerate() {
            for id in &resting {
                if index < matched_upto.get(id).copied().unwrap_or(bars.len()) {
                    continue;
                }
                let Some(order) = orders.get_mut(id).filter(|o| o.is_open()) else {
                    continue;
                };
                let Some(price) = resting_fill_price(order, bar) else {
                    continue;
                };
                order.mark_filled(price, Utc::now());
                *cash -= order.signed_quantity() * price;
                debug!(order_id = %order.id, price, "Paper order filled");

                if let Some(parent) = order.parent_id.clone() {
                    for sibling in orders.values_mut() {
                        if sibling.is_open() && sibling.parent_id.as_deref() == Some(parent.as_str()) {
                            sibling.mark_canceled(Utc::now());
                            debug!(order_id = %sibling.id, "Paper exit leg canceled");
                        }
                    }
                }
            }
        }
        for id in resting {
            matched_upto.insert(id, bars.len());
        }
    }
}

/// Price a resting order executes at on `bar`, if it executes at all. Triggered orders
/// execute at the trigger, or at the open when the bar gapped through it.
fn resting_fill_price(order: &mut Order, bar: &Candle) -> Option<f64> {
    match order.order_type {
        OrderType::Market => Some(bar.open),
        OrderType::Limit => order.price.filter(|p| bar.contains(*p)),
        OrderType::Stop | OrderType::TakeProfit => {
            let trigger = order.stop_price?;
            if !order.trigger_reached(bar) {
                return None;
            }
            order.triggered = true;
            let upward = matches!(
                (order.order_type, order.side),
                (OrderType::Stop, OrderSide::Buy) | (OrderType::TakeProfit, OrderSide::Sell)
            );
            Some(if upward {
                bar.open.max(trigger)
            } else {
                bar.open.min(trigger)
            })
        }
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    fn name(&self) -> &str {
        "paper"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ConnectorResult<Vec<Candle>> {
        self.take_failure()?;
        if timeframe != self.timeframe {
            return Err(ConnectorError::Rejected(format!(
                "paper market only serves {}",
                self.timeframe
            )));
        }
        let bars = self.visible(self.series(symbol)?);
        let selected: Vec<Candle> = match since {
            None => bars[bars.len().saturating_sub(limit)..].to_vec(),
            Some(ts) => bars
                .iter()
                .filter(|c| c.timestamp >= ts)
                .take(limit)
                .cloned()
                .collect(),
        };
        Ok(selected)
    }

    async fn fetch_orders(&self, symbol: &str) -> ConnectorResult<Vec<Order>> {
        self.take_failure()?;
        let bars = self.visible(self.series(symbol)?);
        let mut state = self.state.lock().await;
        self.match_resting(&mut state, symbol, bars);
        Ok(state
            .orders
            .values()
            .filter(|o| o.symbol == symbol)
            .cloned()
            .collect())
    }

    async fn create_order(&self, request: &OrderRequest) -> ConnectorResult<Order> {
        self.take_failure()?;
        if !(request.quantity.is_finite() && request.quantity > 0.0) {
            return Err(ConnectorError::Rejected("quantity must be positive".to_string()));
        }
        let bars = self.visible(self.series(&request.symbol)?);
        let last = bars
            .last()
            .ok_or_else(|| ConnectorError::Rejected("market has no data yet".to_string()))?;

        let mut state = self.state.lock().await;
        state.next_id += 1;
        let id = format!("paper-{:06}", state.next_id);
        let now = Utc::now();
        let mut order = Order::from_request(id.clone(), request, now);
        if request.order_type == OrderType::Market {
            order.mark_filled(last.close, now);
            state.cash -= order.signed_quantity() * last.close;
        }
        state.matched_upto.insert(id.clone(), bars.len());
        state.orders.insert(id, order.clone());
        debug!(order_id = %order.id, symbol = %order.symbol, status = ?order.status, "Paper order accepted");
        Ok(order)
    }

    async fn cancel_order(&self, order_id: &str) -> ConnectorResult<Order> {
        self.take_failure()?;
        let mut state = self.state.lock().await;
        match state.orders.get_mut(order_id) {
            Some(order) if order.is_open() => {
                order.mark_canceled(Utc::now());
                Ok(order.clone())
            }
            _ => Err(ConnectorError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn fetch_balance(&self) -> ConnectorResult<f64> {
        self.take_failure()?;
        Ok(self.state.lock().await.cash)
    }
}
