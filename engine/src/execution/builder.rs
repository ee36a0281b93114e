//! Assemble an [`ExecutionHandler`] from a [`SessionConfig`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::{ExecutionHandler, HandlerOptions};
use crate::broker::Broker;
use crate::config::{ConnectorConfig, SessionConfig, TradingMode};
use crate::data::{load_csv, CandleSeries};
use crate::error::{BuildError, ConfigError};
use crate::exchange::{ExchangeConnector, PaperConnector};
use crate::repository::{BacktestRepository, LiveRepository, Repository};
use crate::strategy::{StrategyRegistration, StrategyRegistry};

/// Load every configured dataset, keyed by symbol
pub fn load_datasets(config: &SessionConfig) -> Result<BTreeMap<String, CandleSeries>, BuildError> {
    let mut datasets = BTreeMap::new();
    for symbol in config.symbols() {
        let path = config
            .datasets
            .get(&symbol)
            .ok_or_else(|| ConfigError::MissingDataset(symbol.clone()))?;
        datasets.insert(symbol, load_csv(path)?);
    }
    Ok(datasets)
}

/// Build the handler for the configured mode. Live sessions run on the paper connector.
pub fn build_handler(config: &SessionConfig) -> Result<ExecutionHandler, BuildError> {
    config.validate()?;
    let datasets = load_datasets(config)?;
    match config.mode {
        TradingMode::Backtest => build_backtest_handler(config, datasets),
        TradingMode::Live => {
            let registrations = StrategyRegistry::new().build_all(&config.strategies)?;
            let warmup = max_lookback(&registrations);
            let ConnectorConfig::Paper { bar_interval_ms } = config.connector;
            let connector = PaperConnector::new(
                datasets,
                config.timeframe,
                config.initial_balance,
                warmup,
                Duration::from_millis(bar_interval_ms.max(1)),
            );
            Ok(assemble_live(config, Arc::new(connector), registrations))
        }
    }
}

/// Backtest handler over in-memory datasets, trimmed to the configured window plus the
/// warm-up bars that precede it
pub fn build_backtest_handler(
    config: &SessionConfig,
    datasets: BTreeMap<String, CandleSeries>,
) -> Result<ExecutionHandler, BuildError> {
    let registrations = StrategyRegistry::new().build_all(&config.strategies)?;
    let lookback = max_lookback(&registrations);
    let mut repository = BacktestRepository::new(config.timeframe).with_start(config.start);
    for symbol in config.symbols() {
        let mut series = datasets
            .get(&symbol)
            .cloned()
            .ok_or_else(|| ConfigError::MissingDataset(symbol.clone()))?;
        series.retain_window(config.start, config.end, lookback);
        info!(symbol = %symbol, candles = series.len(), "Backtest dataset ready");
        repository = repository.with_series(&symbol, series);
    }

    let broker = Broker::new(Repository::Backtest(repository), config);
    Ok(ExecutionHandler::new(broker, registrations, HandlerOptions::from_config(config)))
}

/// Live handler over an externally supplied exchange connector
pub fn build_live_handler(
    config: &SessionConfig,
    connector: Arc<dyn ExchangeConnector>,
) -> Result<ExecutionHandler, BuildError> {
    let registrations = StrategyRegistry::new().build_all(&config.strategies)?;
    Ok(assemble_live(config, connector, registrations))
}

fn assemble_live(
    config: &SessionConfig,
    connector: Arc<dyn ExchangeConnector>,
    registrations: Vec<StrategyRegistration>,
) -> ExecutionHandler {
    info!(connector = connector.name(), user_id = %config.user_id, "Live session assembled");
    let repository = LiveRepository::new(connector, config.retry.clone());
    let broker = Broker::new(Repository::Live(repository), config);
    ExecutionHandler::new(broker, registrations, HandlerOptions::from_config(config))
}

fn max_lookback(registrations: &[StrategyRegistration]) -> usize {
    registrations
        .iter()
        .map(|r| r.strategy.candles_needed())
        .max()
        .unwrap_or(1)
}
