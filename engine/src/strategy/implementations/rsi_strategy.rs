//! Mean reversion on RSI extremes

use async_trait::async_trait;
use tracing::debug;

use crate::broker::Broker;
use crate::error::StrategyError;
use crate::indicators::calculate_rsi;
use crate::strategy::{apply_signal, Signal, Strategy};

/// Parameters read from the strategy spec
#[derive(Debug, Clone)]
pub struct RSIStrategyConfig {
    pub rsi_period: usize,
    /// Enter once RSI falls below this
    pub rsi_oversold: f64,
    /// Exit once RSI rises above this
    pub rsi_overbought: f64,
    /// Fraction of equity committed per entry
    pub allocation: f64,
}

impl Default for RSIStrategyConfig {
    fn default() -> Self {
        Self {
            rsi_period: 14,
            rsi_oversold: 30.0,
            rsi_overbought: 70.0,
            allocation: 0.5,
        }
    }
}

/// RSI mean-reversion strategy: buy oversold, exit overbought
pub struct RSIStrategy {
    config: RSIStrategyConfig,
}

impl RSIStrategy {
    pub fn new(config: RSIStrategyConfig) -> Self {
        Self { config }
    }

    fn signal(&self, closes: &[f64]) -> Result<Signal, StrategyError> {
        let series = calculate_rsi(closes, self.config.rsi_period)
            .map_err(|e| StrategyError::Logic(format!("rsi: {}", e)))?;
        let Some(rsi) = series.last().copied().flatten() else {
            return Ok(Signal::hold("RSI indicator not ready"));
        };
        debug!(rsi, "RSI value");

        if rsi < self.config.rsi_oversold {
            Ok(Signal::buy(format!("RSI oversold: {:.2} < {}", rsi, self.config.rsi_oversold)))
        } else if rsi > self.config.rsi_overbought {
            Ok(Signal::sell(format!("RSI overbought: {:.2} > {}", rsi, self.config.rsi_overbought)))
        } else {
            Ok(Signal::hold(format!("RSI in neutral zone: {:.2}", rsi)))
        }
    }
}

#[async_trait]
impl Strategy for RSIStrategy {
    fn name(&self) -> &str {
        "rsi"
    }

    fn candles_needed(&self) -> usize {
        // ta's RSI is exponentially smoothed; a fixed window keeps backtest and live in step
        self.config.rsi_period * 3
    }

    async fn next(&mut self, broker: &mut Broker, symbol: &str) -> Result<(), StrategyError> {
        let closes: Vec<f64> = broker
            .get_candles(symbol, self.candles_needed())
            .iter()
            .map(|c| c.close)
            .collect();
        let signal = self.signal(&closes)?;
        apply_signal(broker, symbol, &signal, self.config.allocation, self.name()).await?;
        Ok(())
    }
}
