//! The tick loop.
//!
//! Backtest: `next -> update_data -> strategies` until the dataset is exhausted.
//! Live: wait for the next candle boundary (bounded by the poll interval), refresh, fan out.
//! The cancellation flag is read only between ticks, so a tick always runs every
//! registered strategy before the loop exits.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::{ExecutionEvent, HandlerRequest, HandlerState, RunSummary};
use crate::backtest::BacktestReport;
use crate::broker::Broker;
use crate::config::{SessionConfig, TradingMode};
use crate::data::Timeframe;
use crate::error::{BrokerError, ExecutionError};
use crate::exchange::Order;
use crate::strategy::StrategyRegistration;

/// Loop settings taken from the session config
#[derive(Debug, Clone)]
pub struct HandlerOptions {
    pub timeframe: Timeframe,
    pub poll_interval: Duration,
    pub max_consecutive_data_failures: u32,
    pub flatten_on_stop: bool,
}

impl HandlerOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            timeframe: config.timeframe,
            poll_interval: Duration::from_secs(config.poll_interval_secs.max(1)),
            max_consecutive_data_failures: config.max_consecutive_data_failures.max(1),
            flatten_on_stop: config.flatten_on_stop,
        }
    }
}

pub struct ExecutionHandler {
    broker: Broker,
    registrations: Vec<StrategyRegistration>,
    options: HandlerOptions,
    state: HandlerState,
    events: Option<mpsc::UnboundedSender<ExecutionEvent>>,
    requests: Option<mpsc::UnboundedReceiver<HandlerRequest>>,
    /// registration index -> last reported error message
    reported: BTreeMap<usize, String>,
    order_log: Vec<Order>,
    ticks: u64,
}

impl ExecutionHandler {
    pub fn new(broker: Broker, registrations: Vec<StrategyRegistration>, options: HandlerOptions) -> Self {
        Self {
            broker,
            registrations,
            options,
            state: HandlerState::Idle,
            events: None,
            requests: None,
            reported: BTreeMap::new(),
            order_log: Vec::new(),
            ticks: 0,
        }
    }

    /// Stream lifecycle, order and error events to `tx`
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Accept snapshot requests from `rx`, served between ticks
    pub fn with_requests(mut self, rx: mpsc::UnboundedReceiver<HandlerRequest>) -> Self {
        self.requests = Some(rx);
        self
    }

    pub fn state(&self) -> HandlerState {
        self.state
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn mode(&self) -> TradingMode {
        self.broker.mode()
    }

    fn emit(&self, event: ExecutionEvent) {
        if let Some(tx) = &self.events {
            // receiver gone means nobody is listening any more
            let _ = tx.send(event);
        }
    }

    fn transition(&mut self, to: HandlerState) -> Result<(), ExecutionError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(ExecutionError::InvalidState { from, to });
        }
        self.state = to;
        debug!(?from, ?to, "Handler state changed");
        self.emit(ExecutionEvent::StateChanged { from, to });
        Ok(())
    }

    /// Enter `Crashed` and emit the single terminal error event.
    fn crash(&mut self, err: ExecutionError) -> ExecutionError {
        error!(error = %err, "Execution crashed");
        if let Err(invalid) = self.transition(HandlerState::Crashed) {
            warn!(error = %invalid, "Crash from unexpected state");
            self.state = HandlerState::Crashed;
        }
        self.emit(ExecutionEvent::Crashed {
            kind: err.kind(),
            message: err.to_string(),
        });
        err
    }

    /// Run the session to completion.
    ///
    /// Returns the summary on a graceful stop (cancellation or exhausted data). Any
    /// returned error has already been emitted as a `Crashed` event.
    pub async fn run(&mut self, mut cancel: watch::Receiver<bool>) -> Result<RunSummary, ExecutionError> {
        if self.registrations.is_empty() {
            return Err(self.crash(ExecutionError::NoStrategies));
        }
        self.transition(HandlerState::Running)?;

        let lookback = self
            .registrations
            .iter()
            .map(|r| r.strategy.candles_needed())
            .max()
            .unwrap_or(1);
        if let Err(e) = self.broker.prepare_initial_data(lookback).await {
            return Err(self.crash(e.into()));
        }
        self.flush_order_updates();

        for idx in 0..self.registrations.len() {
            let registration = &mut self.registrations[idx];
            let symbol = registration.symbol.clone();
            let outcome = AssertUnwindSafe(registration.strategy.setup(&mut self.broker, &symbol))
                .catch_unwind()
                .await;
            self.record_outcome(idx, outcome.map_err(panic_message).and_then(|r| r.map_err(|e| e.to_string())));
        }
        self.flush_order_updates();

        info!(
            mode = ?self.broker.mode(),
            strategies = self.registrations.len(),
            lookback,
            "Execution started"
        );

        let mut requests = self.requests.take();
        let outcome = match self.broker.mode() {
            TradingMode::Backtest => self.run_backtest(&mut cancel, &mut requests).await,
            TradingMode::Live => self.run_live(&mut cancel, &mut requests).await,
        };
        self.requests = requests;

        match outcome {
            Ok(()) => self.finish().await,
            Err(e) => Err(self.crash(e)),
        }
    }

    async fn run_backtest(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
        requests: &mut Option<mpsc::UnboundedReceiver<HandlerRequest>>,
    ) -> Result<(), ExecutionError> {
        loop {
            if *cancel.borrow() {
                info!(ticks = self.ticks, "Backtest canceled");
                return Ok(());
            }
            self.serve_pending(requests);

            let advanced = match self.broker.as_backtest_mut() {
                Some(sim) => sim.next()?,
                None => false,
            };
            if !advanced {
                info!(ticks = self.ticks, "Backtest data exhausted");
                return Ok(());
            }
            self.broker.update_data().await?;
            self.flush_order_updates();
            self.fan_out().await;
            self.ticks += 1;
        }
    }

    async fn run_live(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
        requests: &mut Option<mpsc::UnboundedReceiver<HandlerRequest>>,
    ) -> Result<(), ExecutionError> {
        let mut failures: u32 = 0;
        let mut sender_gone = false;

        loop {
            if *cancel.borrow() || sender_gone {
                info!(ticks = self.ticks, "Live session canceled");
                return Ok(());
            }
            self.serve_pending(requests);

            match self.broker.update_data().await {
                Ok(()) => {
                    if failures > 0 {
                        info!(failures, "Market data recovered");
                    }
                    failures = 0;
                    self.flush_order_updates();
                    self.fan_out().await;
                    self.ticks += 1;
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    warn!(error = %e, failures, "Market data refresh failed, skipping tick");
                    if failures == 1 {
                        self.emit(ExecutionEvent::DataError {
                            kind: e.kind(),
                            message: e.to_string(),
                        });
                    }
                    if failures >= self.options.max_consecutive_data_failures {
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e.into()),
            }

            let deadline = Instant::now() + self.next_wait();
            loop {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    changed = cancel.changed() => {
                        sender_gone = changed.is_err();
                        break;
                    }
                    Some(request) = next_request(requests) => self.serve(request),
                }
            }
        }
    }

    /// Time until the next candle close, capped by the poll interval
    fn next_wait(&self) -> Duration {
        let now = Utc::now();
        let boundary = self.options.timeframe.next_boundary(now);
        let until_boundary = (boundary - now).to_std().unwrap_or(Duration::ZERO);
        until_boundary.min(self.options.poll_interval)
    }

    /// Invoke every strategy once, in registration order. Failures stay with their strategy.
    async fn fan_out(&mut self) {
        for idx in 0..self.registrations.len() {
            let registration = &mut self.registrations[idx];
            let symbol = registration.symbol.clone();
            let outcome = AssertUnwindSafe(registration.strategy.next(&mut self.broker, &symbol))
                .catch_unwind()
                .await;
            self.record_outcome(idx, outcome.map_err(panic_message).and_then(|r| r.map_err(|e| e.to_string())));
            self.flush_order_updates();
        }
    }

    fn record_outcome(&mut self, idx: usize, outcome: Result<(), String>) {
        match outcome {
            Ok(()) => {
                self.reported.remove(&idx);
            }
            Err(message) => {
                let registration = &self.registrations[idx];
                let label = registration.label();
                if self.reported.get(&idx) == Some(&message) {
                    debug!(strategy = %label, "Repeated strategy error suppressed");
                    return;
                }
                warn!(strategy = %label, error = %message, "Strategy error");
                self.emit(ExecutionEvent::StrategyError {
                    strategy: registration.strategy.name().to_string(),
                    symbol: registration.symbol.clone(),
                    message: message.clone(),
                });
                self.reported.insert(idx, message);
            }
        }
    }

    fn flush_order_updates(&mut self) {
        for order in self.broker.drain_order_updates() {
            self.emit(ExecutionEvent::OrderUpdate(order.clone()));
            self.order_log.push(order);
        }
    }

    fn serve_pending(&mut self, requests: &mut Option<mpsc::UnboundedReceiver<HandlerRequest>>) {
        let Some(rx) = requests else {
            return;
        };
        while let Ok(request) = rx.try_recv() {
            self.serve(request);
        }
    }

    fn serve(&mut self, request: HandlerRequest) {
        match request {
            HandlerRequest::Snapshot => self.emit(ExecutionEvent::Snapshot {
                at: self.broker.current_time(),
                account: self.broker.account().snapshot(),
            }),
        }
    }

    async fn flatten(&mut self) -> Result<(), BrokerError> {
        let canceled = self.broker.cancel_all_orders(None).await?;
        for symbol in self.broker.symbols() {
            self.broker.close_position(&symbol).await?;
        }
        self.broker.update_data().await?;
        info!(canceled = canceled.len(), "Flattened on stop");
        Ok(())
    }

    async fn finish(&mut self) -> Result<RunSummary, ExecutionError> {
        self.transition(HandlerState::Stopping)?;
        if self.options.flatten_on_stop && self.broker.mode() == TradingMode::Live {
            if let Err(e) = self.flatten().await {
                warn!(error = %e, "Flatten on stop failed");
            }
        }
        self.flush_order_updates();
        self.transition(HandlerState::Stopped)?;

        let report = self
            .broker
            .as_backtest()
            .map(|sim| BacktestReport::from_run(sim.initial_balance(), sim.account(), sim.fills(), sim.equity_history()));
        let summary = RunSummary {
            state: self.state,
            ticks: self.ticks,
            account: self.broker.account().snapshot(),
            orders: self.order_log.clone(),
            fills: self.broker.fills().to_vec(),
            report,
        };
        info!(
            ticks = summary.ticks,
            equity = summary.account.equity,
            orders = summary.orders.len(),
            "Execution finished"
        );
        self.emit(ExecutionEvent::Finished(Box::new(summary.clone())));
        Ok(summary)
    }
}

async fn next_request(
    requests: &mut Option<mpsc::UnboundedReceiver<HandlerRequest>>,
) -> Option<HandlerRequest> {
    match requests {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("strategy panicked: {}", detail)
}

