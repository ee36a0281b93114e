//! Worker session tests over the in-memory bus

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use serde_json::json;
use shared::{ControlMessage, MemoryBus, MessageChannel, MessageType};
use trader_engine::config::{SessionConfig, StrategySpec, TradingMode};
use trader_engine::data::{Candle, CandleSeries, Timeframe};
use trader_engine::exchange::PaperConnector;
use trader_engine::execution::{build_backtest_handler, build_live_handler};
use trader_worker::{WorkerSession, EXIT_OK, EXIT_REPORTED, EXIT_UNREPORTED};

const USER: &str = "1001";
const SYMBOL: &str = "ETHUSDT";

fn dataset(bars: i64) -> BTreeMap<String, CandleSeries> {
    let candles = (0..bars)
        .map(|i| {
            let price = 2_000.0 + (i as f64 / 4.0).sin() * 50.0;
            let ts = Utc.timestamp_opt(1_700_000_000 + i * 60, 0).unwrap();
            Candle::new(ts, price - 1.0, price + 5.0, price - 5.0, price, 3.0)
        })
        .collect();
    BTreeMap::from([(SYMBOL.to_string(), CandleSeries::from_vec(candles))])
}

fn config(mode: TradingMode, strategy: &str) -> SessionConfig {
    let mut config = SessionConfig::new(USER, mode, Timeframe::M1);
    config.strategies = vec![StrategySpec::new(strategy, SYMBOL)];
    config.poll_interval_secs = 1;
    config
}

fn setup() -> (Arc<MemoryBus>, MessageChannel) {
    let bus = Arc::new(MemoryBus::new());
    let channel = MessageChannel::for_user(bus.clone(), USER, "test-secret");
    (bus, channel)
}

fn published(bus: &MemoryBus, channel: &MessageChannel) -> Vec<ControlMessage> {
    bus.drain(&channel.status_queue())
        .iter()
        .map(|raw| ControlMessage::from_json(raw).unwrap())
        .collect()
}

fn events(messages: &[ControlMessage]) -> Vec<&str> {
    messages.iter().filter_map(ControlMessage::event).collect()
}

#[tokio::test]
async fn backtest_session_reports_and_exits_cleanly() {
    let (bus, channel) = setup();
    let handler = build_backtest_handler(&config(TradingMode::Backtest, "buy_and_hold"), dataset(30)).unwrap();

    let code = WorkerSession::new(USER, channel.clone()).run_handler(handler).await;
    let messages = published(&bus, &channel);
    let events = events(&messages);

    assert_eq!(code, EXIT_OK);
    assert_eq!(events.first(), Some(&"started"));
    assert!(events.contains(&"order"));
    assert_eq!(&events[events.len() - 2..], &["report", "finished"]);
    assert!(messages.iter().all(|m| m.kind == MessageType::Status));
    assert!(messages.iter().all(|m| m.user_id == USER));
}

#[tokio::test]
async fn startup_failure_is_reported_once() {
    let (bus, channel) = setup();
    let mut config = config(TradingMode::Backtest, "martingale");
    config.datasets.insert(SYMBOL.to_string(), "/nonexistent.csv".into());

    let code = WorkerSession::new(USER, channel.clone()).run(config).await;
    let messages = published(&bus, &channel);

    assert_eq!(code, EXIT_REPORTED);
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].event(), Some("configuration"));
}

#[tokio::test(start_paused = true)]
async fn unpublished_startup_failure_exits_unreported() {
    let (bus, channel) = setup();
    let mut config = config(TradingMode::Backtest, "martingale");
    config.datasets.insert(SYMBOL.to_string(), "/nonexistent.csv".into());
    bus.fail_next(u32::MAX);

    let code = WorkerSession::new(USER, channel.clone()).run(config).await;

    assert_eq!(code, EXIT_UNREPORTED);
    assert_ne!(code, EXIT_REPORTED);
    bus.fail_next(0);
    assert!(published(&bus, &channel).is_empty());
}

#[tokio::test]
async fn insufficient_history_crashes_with_one_error() {
    let (bus, channel) = setup();
    let mut config = config(TradingMode::Backtest, "sma_cross");
    config.strategies[0].params = json!({"fast": 5, "slow": 50});
    let handler = build_backtest_handler(&config, dataset(20)).unwrap();

    let code = WorkerSession::new(USER, channel.clone()).run_handler(handler).await;
    let messages = published(&bus, &channel);

    assert_eq!(code, EXIT_REPORTED);
    let errors: Vec<&ControlMessage> = messages.iter().filter(|m| m.kind == MessageType::Error).collect();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].event(), Some("insufficient_history"));
    assert_eq!(messages.last().and_then(ControlMessage::event), Some("insufficient_history"));
}

#[tokio::test(start_paused = true)]
async fn live_session_serves_commands_until_stopped() {
    let (bus, channel) = setup();
    let config = config(TradingMode::Live, "buy_and_hold");
    let connector = PaperConnector::new(dataset(120), Timeframe::M1, 50_000.0, 1, Duration::from_secs(1));
    let handler = build_live_handler(&config, Arc::new(connector)).unwrap();

    let session = tokio::spawn(WorkerSession::new(USER, channel.clone()).run_handler(handler));
    tokio::time::sleep(Duration::from_secs(3)).await;

    channel.publish_command(&ControlMessage::command(USER, json!("status"))).await.unwrap();
    channel.publish_command(&ControlMessage::command(USER, json!("rebalance"))).await.unwrap();
    channel.publish_command(&ControlMessage::start(USER, json!({}))).await.unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    channel.publish_command(&ControlMessage::stop(USER).with_dedup_id("stop-1")).await.unwrap();

    let code = session.await.unwrap();
    let messages = published(&bus, &channel);
    let events = events(&messages);

    assert_eq!(code, EXIT_OK);
    assert!(events.contains(&"snapshot"));
    assert_eq!(events.iter().filter(|e| **e == "unknown_command").count(), 1);
    assert_eq!(events.iter().filter(|e| **e == "session_already_active").count(), 1);
    assert_eq!(events.last(), Some(&"finished"));
    assert_eq!(events.iter().filter(|e| **e == "finished").count(), 1);
}

#[tokio::test(start_paused = true)]
async fn commands_for_other_users_are_ignored() {
    let (bus, channel) = setup();
    let config = config(TradingMode::Live, "buy_and_hold");
    let connector = PaperConnector::new(dataset(120), Timeframe::M1, 50_000.0, 1, Duration::from_secs(1));
    let handler = build_live_handler(&config, Arc::new(connector)).unwrap();

    let session = tokio::spawn(WorkerSession::new(USER, channel.clone()).run_handler(handler));
    channel.publish_command(&ControlMessage::stop("someone-else")).await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!session.is_finished());

    channel.publish_command(&ControlMessage::stop(USER)).await.unwrap();
    assert_eq!(session.await.unwrap(), EXIT_OK);
    assert_eq!(events(&published(&bus, &channel)).last(), Some(&"finished"));
}
