//! Backtest broker: simulated clock over the dataset timeline, deterministic fills.

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::fill::{self, FillDecision};
use super::validate_request;
use crate::data::{Candle, CandleSeries};
use crate::error::BrokerError;
use crate::exchange::{Order, OrderRequest};
use crate::portfolio::{AccountState, Fill, Position, RiskManager};
use crate::repository::BacktestRepository;

/// Equity after one simulated bar
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: DateTime<Utc>,
    pub equity: f64,
}

pub struct BacktestBroker {
    repository: BacktestRepository,
    account: AccountState,
    initial_balance: f64,
    risk: RiskManager,
    fee_rate: f64,
    timeline: Vec<DateTime<Utc>>,
    cursor: usize,
    lookback: usize,
    prepared: bool,
    window: BTreeMap<String, CandleSeries>,
    last_prices: BTreeMap<String, f64>,
    equity_history: Vec<EquityPoint>,
    fills: Vec<Fill>,
    order_updates: Vec<Order>,
}

impl BacktestBroker {
    pub fn new(repository: BacktestRepository, initial_balance: f64, max_leverage: f64, fee_rate: f64) -> Self {
        let timeline = repository.timeline();
        Self {
            repository,
            account: AccountState::new(initial_balance),
            initial_balance,
            risk: RiskManager::new(max_leverage),
            fee_rate,
            timeline,
            cursor: 0,
            lookback: 1,
            prepared: false,
            window: BTreeMap::new(),
            last_prices: BTreeMap::new(),
            equity_history: Vec::new(),
            fills: Vec::new(),
            order_updates: Vec::new(),
        }
    }

    /// One-shot warm-up: positions the clock so that the first tick already sees
    /// `lookback` candles for every symbol and is not earlier than the window start.
    pub fn prepare_initial_data(&mut self, lookback: usize) -> Result<(), BrokerError> {
        if self.prepared {
            return Err(BrokerError::AlreadyPrepared);
        }
        let lookback = lookback.max(1);

        let mut first_tick: Option<DateTime<Utc>> = None;
        for symbol in self.repository.symbols() {
            let candles = self
                .repository
                .series(symbol)
                .map(CandleSeries::candles)
                .unwrap_or(&[]);
            let Some(warm) = candles.get(lookback - 1) else {
                return Err(BrokerError::InsufficientHistory {
                    symbol: symbol.clone(),
                    needed: lookback,
                    available: candles.len(),
                });
            };
            first_tick = Some(first_tick.map_or(warm.timestamp, |t| t.max(warm.timestamp)));
        }

        let warm = first_tick.ok_or_else(|| BrokerError::InsufficientHistory {
            symbol: String::new(),
            needed: lookback,
            available: 0,
        })?;
        let first_tick = self.repository.start().map_or(warm, |start| start.max(warm));
        self.cursor = self.timeline.partition_point(|t| *t < first_tick);
        if self.cursor > 0 {
            self.repository.set_clock(self.timeline[self.cursor - 1]);
        }
        self.lookback = lookback;
        self.prepared = true;
        self.update_data()?;

        info!(
            lookback,
            bars = self.timeline.len() - self.cursor,
            start = %first_tick,
            "Backtest data prepared"
        );
        Ok(())
    }

    /// Advance the simulated clock one bar and match working orders against it.
    /// Returns `false` once the dataset is exhausted.
    pub fn next(&mut self) -> Result<bool, BrokerError> {
        let Some(&ts) = self.timeline.get(self.cursor) else {
            return Ok(false);
        };
        self.cursor += 1;
        self.repository.set_clock(ts);

        self.match_orders(ts)?;

        for symbol in self.repository.symbols().to_vec() {
            if let Some(bar) = self.bar_at(&symbol, ts) {
                let close = bar.close;
                self.last_prices.insert(symbol.clone(), close);
                self.account.mark(&symbol, close);
            }
        }
        self.account.recompute();
        self.equity_history.push(EquityPoint {
            timestamp: ts,
            equity: self.account.equity,
        });
        Ok(true)
    }

    fn bar_at(&self, symbol: &str, ts: DateTime<Utc>) -> Option<&Candle> {
        self.repository.series(symbol)?.at(ts)
    }

    fn match_orders(&mut self, ts: DateTime<Utc>) -> Result<(), BrokerError> {
        let mut working = self.repository.open_orders();
        working.sort_by(|a, b| fill::rank(a).cmp(&fill::rank(b)).then_with(|| a.id.cmp(&b.id)));
        let mut queue: VecDeque<Order> = working.into();

        while let Some(order) = queue.pop_front() {
            // canceled earlier in this bar by a sibling exit leg
            if !self.repository.order(&order.id).is_some_and(Order::is_open) {
                continue;
            }
            // symbol has no bar at this timestamp; the order waits for its next bar
            let Some(bar) = self.bar_at(&order.symbol, ts).cloned() else {
                continue;
            };
            match fill::evaluate(&order, &bar) {
                FillDecision::Fill(price) => {
                    let filled = self.repository.fill_order(&order.id, price)?;
                    let fill = self.account.apply_fill(&filled, price, self.fee_rate, ts);
                    debug!(order_id = %filled.id, symbol = %filled.symbol, price, "Order filled");
                    self.fills.push(fill);
                    self.order_updates.push(filled.clone());
                    // exit legs watch the rest of the bar the entry filled on
                    queue.extend(self.settle_contingents(&filled)?);
                }
                FillDecision::Trigger => {
                    let armed = self.repository.mark_triggered(&order.id)?;
                    debug!(order_id = %armed.id, kind = ?armed.order_type, "Trigger reached");
                    self.account.open_orders.insert(armed.id.clone(), armed.clone());
                    self.order_updates.push(armed);
                }
                FillDecision::Wait => {}
            }
        }
        Ok(())
    }

    /// Place the exit legs of a filled entry, or retire the legs a fill made obsolete:
    /// the siblings of an executed leg and every leg left once the position is flat.
    fn settle_contingents(&mut self, filled: &Order) -> Result<Vec<Order>, BrokerError> {
        let mut placed = Vec::new();
        if filled.parent_id.is_none() {
            for leg in filled.contingent_requests() {
                let order = self.repository.create_order(&leg)?;
                debug!(order_id = %order.id, parent = %filled.id, kind = ?order.order_type, "Exit leg placed");
                self.account.open_orders.insert(order.id.clone(), order.clone());
                self.order_updates.push(order.clone());
                placed.push(order);
            }
        }

        let flat = self.account.position(&filled.symbol).is_none();
        let obsolete: Vec<String> = self
            .repository
            .open_orders()
            .into_iter()
            .filter(|o| o.symbol == filled.symbol)
            .filter(|o| match (&o.parent_id, &filled.parent_id) {
                (Some(parent), Some(executed)) if parent == executed => true,
                (Some(_), _) => flat,
                (None, _) => false,
            })
            .map(|o| o.id)
            .collect();
        for order_id in obsolete {
            let canceled = self.repository.cancel_order(&order_id)?;
            debug!(order_id = %canceled.id, "Exit leg canceled");
            self.account.open_orders.remove(&order_id);
            self.order_updates.push(canceled);
        }
        Ok(placed)
    }

    /// Refresh the in-window candle cache up to the current clock.
    pub fn update_data(&mut self) -> Result<(), BrokerError> {
        for symbol in self.repository.symbols().to_vec() {
            let candles = self.repository.fetch_ohlcv(
                &symbol,
                self.repository.timeframe(),
                None,
                self.lookback,
            )?;
            self.window.insert(symbol, CandleSeries::from_vec(candles));
        }
        Ok(())
    }

    /// Last `lookback` candles at or before the clock
    pub fn get_candles(&self, symbol: &str, lookback: usize) -> Vec<Candle> {
        match self.window.get(symbol) {
            Some(window) if window.len() >= lookback => window.tail(lookback).to_vec(),
            _ => self
                .repository
                .fetch_ohlcv(symbol, self.repository.timeframe(), None, lookback)
                .unwrap_or_default(),
        }
    }

    pub fn place_order(&mut self, request: &OrderRequest) -> Result<Order, BrokerError> {
        validate_request(
            request,
            self.repository.series(&request.symbol).is_some(),
            self.last_price(&request.symbol),
        )?;
        self.risk
            .check_order(&self.account, request, &self.last_prices)?;

        let order = self.repository.create_order(request)?;
        debug!(order_id = %order.id, symbol = %order.symbol, side = ?order.side, kind = ?order.order_type, quantity = order.quantity, "Order placed");
        self.account.open_orders.insert(order.id.clone(), order.clone());
        self.order_updates.push(order.clone());
        Ok(order)
    }

    pub fn cancel_order(&mut self, order_id: &str) -> Result<Order, BrokerError> {
        let order = self.repository.cancel_order(order_id)?;
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

    pub fn current_time(&self) -> Option<DateTime<Utc>> {
        self.repository.clock()
    }

    pub fn symbols(&self) -> &[String] {
        self.repository.symbols()
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.timeline.len()
    }

    pub fn equity_history(&self) -> &[EquityPoint] {
        &self.equity_history
    }

    pub fn fills(&self) -> &[Fill] {
        &self.fills
    }

    pub fn drain_order_updates(&mut self) -> Vec<Order> {
        std::mem::take(&mut self.order_updates)
    }
}
