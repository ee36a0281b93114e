//! Live loop tests over the paper connector with paused time

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{mpsc, watch};

use trader_engine::config::{SessionConfig, StrategySpec, TradingMode};
use trader_engine::data::{Candle, CandleSeries, Timeframe};
use trader_engine::error::{ErrorKind, ExecutionError};
use trader_engine::exchange::{
    ConnectorError, ConnectorResult, ExchangeConnector, Order, OrderRequest, PaperConnector,
};
use trader_engine::execution::{build_live_handler, ExecutionEvent, HandlerState};

const SYMBOL: &str = "BTCUSDT";

fn market() -> BTreeMap<String, CandleSeries> {
    let candles = (0..60)
        .map(|i| {
            let price = 30_000.0 + i as f64 * 10.0;
            let ts: DateTime<Utc> = Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap();
            Candle::new(ts, price - 5.0, price + 20.0, price - 20.0, price, 1.5)
        })
        .collect();
    BTreeMap::from([(SYMBOL.to_string(), CandleSeries::from_vec(candles))])
}

/// Paper connector whose n-th `fetch_ohlcv` calls (1-based) fail transiently
struct ScriptedConnector {
    inner: PaperConnector,
    failing_calls: BTreeSet<usize>,
    fail_from: Option<usize>,
    calls: AtomicUsize,
}

impl ScriptedConnector {
    fn new(failing_calls: impl IntoIterator<Item = usize>, fail_from: Option<usize>) -> Self {
        Self {
            inner: PaperConnector::new(market(), Timeframe::M1, 100_000.0, 1, Duration::from_secs(1)),
            failing_calls: failing_calls.into_iter().collect(),
            fail_from,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ExchangeConnector for ScriptedConnector {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch_ohlcv(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> ConnectorResult<Vec<Candle>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_calls.contains(&call) || self.fail_from.is_some_and(|from| call >= from) {
            return Err(ConnectorError::Transient("gateway timeout".to_string()));
        }
        self.inner.fetch_ohlcv(symbol, timeframe, since, limit).await
    }

    async fn fetch_orders(&self, symbol: &str) -> ConnectorResult<Vec<Order>> {
        self.inner.fetch_orders(symbol).await
    }

    async fn create_order(&self, request: &OrderRequest) -> ConnectorResult<Order> {
        self.inner.create_order(request).await
    }

    async fn cancel_order(&self, order_id: &str) -> ConnectorResult<Order> {
        self.inner.cancel_order(order_id).await
    }

    async fn fetch_balance(&self) -> ConnectorResult<f64> {
        self.inner.fetch_balance().await
    }
}

fn live_config() -> SessionConfig {
    let mut config = SessionConfig::new("user-7", TradingMode::Live, Timeframe::M1);
    config.strategies = vec![StrategySpec::new("buy_and_hold", SYMBOL)];
    config.poll_interval_secs = 1;
    config.retry.max_attempts = 1;
    config.max_consecutive_data_failures = 3;
    config
}

fn drain(rx: &mut mpsc::UnboundedReceiver<ExecutionEvent>) -> Vec<ExecutionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test(start_paused = true)]
async fn live_session_trades_until_canceled() {
    let connector = Arc::new(ScriptedConnector::new([], None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handler = build_live_handler(&live_config(), connector).unwrap().with_events(tx);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move { handler.run(cancel_rx).await });
    tokio::time::sleep(Duration::from_secs(10)).await;
    cancel_tx.send(true).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.state, HandlerState::Stopped);
    assert!(summary.ticks >= 2);
    assert_eq!(summary.fills.len(), 1);
    assert!(summary.account.positions.contains_key(SYMBOL));
    assert!(summary.report.is_none());

    let events = drain(&mut rx);
    assert!(matches!(events.last(), Some(ExecutionEvent::Finished(_))));
}

#[tokio::test(start_paused = true)]
async fn flatten_on_stop_closes_positions() {
    let mut config = live_config();
    config.flatten_on_stop = true;
    let connector = Arc::new(ScriptedConnector::new([], None));
    let mut handler = build_live_handler(&config, connector).unwrap();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move { handler.run(cancel_rx).await });
    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel_tx.send(true).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.fills.len(), 2);
    assert!(summary.account.positions.is_empty());
    assert_eq!(summary.fills[1].strategy.as_deref(), Some("close_position"));
}

#[tokio::test(start_paused = true)]
async fn dropped_cancel_sender_stops_the_session() {
    let connector = Arc::new(ScriptedConnector::new([], None));
    let mut handler = build_live_handler(&live_config(), connector).unwrap();
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move { handler.run(cancel_rx).await });
    tokio::time::sleep(Duration::from_secs(3)).await;
    drop(cancel_tx);

    let summary = task.await.unwrap().unwrap();
    assert_eq!(summary.state, HandlerState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn transient_data_failures_skip_ticks_and_recover() {
    // call 1 is the warm-up fetch; the next two refreshes fail
    let connector = Arc::new(ScriptedConnector::new([2, 3], None));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handler = build_live_handler(&live_config(), connector).unwrap().with_events(tx);
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let task = tokio::spawn(async move { handler.run(cancel_rx).await });
    tokio::time::sleep(Duration::from_secs(10)).await;
    cancel_tx.send(true).unwrap();
    let summary = task.await.unwrap().unwrap();

    assert_eq!(summary.state, HandlerState::Stopped);
    assert!(summary.ticks >= 1);
    let data_errors: Vec<ErrorKind> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            ExecutionEvent::DataError { kind, .. } => Some(kind),
            _ => None,
        })
        .collect();
    assert_eq!(data_errors, vec![ErrorKind::TransientRepository]);
}

#[tokio::test(start_paused = true)]
async fn persistent_data_failures_crash_the_session() {
    let connector = Arc::new(ScriptedConnector::new([], Some(2)));
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handler = build_live_handler(&live_config(), connector).unwrap().with_events(tx);
    let (_cancel_tx, cancel_rx) = watch::channel(false);

    let err = handler.run(cancel_rx).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::TransientRepository);
    assert!(matches!(err, ExecutionError::Broker(_)));
    assert_eq!(handler.state(), HandlerState::Crashed);
    let events = drain(&mut rx);
    let terminal: Vec<&ExecutionEvent> = events.iter().filter(|e| e.is_terminal()).collect();
    assert_eq!(terminal.len(), 1);
    assert!(matches!(
        terminal[0],
        ExecutionEvent::Crashed { kind: ErrorKind::TransientRepository, .. }
    ));
}
