//! Per-session configuration
//!
//! A `SessionConfig` is built once per user session (the worker receives it as JSON in its
//! environment) and handed explicitly to the repository and broker constructors.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RetryConfig, StrategySpec};
use crate::data::Timeframe;
use crate::error::ConfigError;

/// Which variant of every role gets built for the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradingMode {
    Backtest,
    Live,
}

/// Exchange connector used by live sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConnectorConfig {
    /// Replays the session datasets in wall-clock time, one bar every `bar_interval_ms`
    Paper {
        #[serde(default = "default_bar_interval_ms")]
        bar_interval_ms: u64,
    },
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self::Paper {
            bar_interval_ms: default_bar_interval_ms(),
        }
    }
}

fn default_bar_interval_ms() -> u64 {
    1_000
}

fn default_max_leverage() -> f64 {
    1.0
}

fn default_initial_balance() -> f64 {
    10_000.0
}

fn default_poll_interval_secs() -> u64 {
    60
}

fn default_max_data_failures() -> u32 {
    5
}

/// Session configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Filled in from the lifecycle message when omitted
    #[serde(default)]
    pub user_id: String,
    pub mode: TradingMode,
    pub timeframe: Timeframe,
    #[serde(default = "default_initial_balance")]
    pub initial_balance: f64,
    /// Projected gross exposure may not exceed `equity * max_leverage`
    #[serde(default = "default_max_leverage")]
    pub max_leverage: f64,
    /// Fee charged on every fill as a fraction of notional
    #[serde(default)]
    pub fee_rate: f64,
    pub strategies: Vec<StrategySpec>,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Upper bound on the wait between two live ticks
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Symbol -> CSV file with the candles for that symbol
    #[serde(default)]
    pub datasets: BTreeMap<String, PathBuf>,
    /// Backtest window start (inclusive)
    #[serde(default)]
    pub start: Option<DateTime<Utc>>,
    /// Backtest window end (inclusive)
    #[serde(default)]
    pub end: Option<DateTime<Utc>>,
    /// Cancel open orders and close positions when a live session stops
    #[serde(default)]
    pub flatten_on_stop: bool,
    /// Consecutive failed live refreshes tolerated before the session crashes
    #[serde(default = "default_max_data_failures")]
    pub max_consecutive_data_failures: u32,
    #[serde(default)]
    pub connector: ConnectorConfig,
}

impl SessionConfig {
    pub fn new(user_id: impl Into<String>, mode: TradingMode, timeframe: Timeframe) -> Self {
        Self {
            user_id: user_id.into(),
            mode,
            timeframe,
            initial_balance: default_initial_balance(),
            max_leverage: default_max_leverage(),
            fee_rate: 0.0,
            strategies: Vec::new(),
            retry: RetryConfig::default(),
            poll_interval_secs: default_poll_interval_secs(),
            datasets: BTreeMap::new(),
            start: None,
            end: None,
            flatten_on_stop: false,
            max_consecutive_data_failures: default_max_data_failures(),
            connector: ConnectorConfig::default(),
        }
    }

    /// Distinct traded symbols in first-registration order.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for spec in &self.strategies {
            if !symbols.contains(&spec.symbol) {
                symbols.push(spec.symbol.clone());
            }
        }
        symbols
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.user_id.trim().is_empty() {
            return Err(ConfigError::Invalid("user_id must not be empty".to_string()));
        }
        if self.strategies.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one strategy is required".to_string(),
            ));
        }
        if !(self.initial_balance.is_finite() && self.initial_balance > 0.0) {
            return Err(ConfigError::Invalid(
                "initial_balance must be positive".to_string(),
            ));
        }
        if !(self.max_leverage.is_finite() && self.max_leverage > 0.0) {
            return Err(ConfigError::Invalid(
                "max_leverage must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.fee_rate) {
            return Err(ConfigError::Invalid(
                "fee_rate must be within [0, 1)".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            if start > end {
                return Err(ConfigError::Invalid("start is after end".to_string()));
            }
        }
        for symbol in self.symbols() {
            if !self.datasets.contains_key(&symbol) {
                return Err(ConfigError::MissingDataset(symbol));
            }
        }
        Ok(())
    }
}
