//! Moving-average crossover strategy

use async_trait::async_trait;

use crate::broker::Broker;
use crate::error::StrategyError;
use crate::indicators::calculate_sma;
use crate::strategy::{apply_signal, Signal, Strategy};

#[derive(Debug, Clone)]
pub struct SmaCrossConfig {
    pub fast: usize,
    pub slow: usize,
    pub allocation: f64,
}

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            fast: 10,
            slow: 30,
            allocation: 0.5,
        }
    }
}

/// Enter when the fast SMA crosses above the slow one, exit on the cross back down
pub struct SmaCrossStrategy {
    config: SmaCrossConfig,
}

impl SmaCrossStrategy {
    pub fn new(config: SmaCrossConfig) -> Self {
        Self { config }
    }

    fn signal(&self, closes: &[f64]) -> Result<Signal, StrategyError> {
        let to_logic = |e: ta::errors::TaError| StrategyError::Logic(format!("sma: {}", e));
        let fast = calculate_sma(closes, self.config.fast).map_err(to_logic)?;
        let slow = calculate_sma(closes, self.config.slow).map_err(to_logic)?;
        let n = closes.len();
        if n < 2 {
            return Ok(Signal::hold("not enough candles"));
        }

        let (Some(f0), Some(s0), Some(f1), Some(s1)) = (fast[n - 2], slow[n - 2], fast[n - 1], slow[n - 1]) else {
            return Ok(Signal::hold("averages not ready"));
        };
        if f0 <= s0 && f1 > s1 {
            Ok(Signal::buy(format!("fast {:.2} crossed above slow {:.2}", f1, s1)))
        } else if f0 >= s0 && f1 < s1 {
            Ok(Signal::sell(format!("fast {:.2} crossed below slow {:.2}", f1, s1)))
        } else {
            Ok(Signal::hold("no cross"))
        }
    }
}

#[async_trait]
impl Strategy for SmaCrossStrategy {
    fn name(&self) -> &str {
        "sma_cross"
    }

    fn candles_needed(&self) -> usize {
        self.config.slow + 1
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::SignalType;

    #[test]
    fn detects_upward_cross() {
        let strategy = SmaCrossStrategy::new(SmaCrossConfig {
            fast: 2,
            slow: 3,
            allocation: 1.0,
        });
        // fast == slow on the flat part, then the jump lifts the fast average above
        let closes = [10.0, 10.0, 10.0, 10.0, 13.0];
        assert_eq!(strategy.signal(&closes).unwrap().signal_type, SignalType::Buy);
    }

    #[test]
    fn detects_downward_cross() {
        let strategy = SmaCrossStrategy::new(SmaCrossConfig {
            fast: 2,
            slow: 3,
            allocation: 1.0,
        });
        let closes = [10.0, 10.0, 10.0, 10.0, 7.0];
        assert_eq!(strategy.signal(&closes).unwrap().signal_type, SignalType::Sell);
    }
}
