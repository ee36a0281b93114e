//! Base strategy trait

use async_trait::async_trait;

use crate::broker::Broker;
use crate::error::StrategyError;

/// Decision logic invoked once per tick for the symbol it is registered on.
///
/// Implementations must re-query the broker on every call instead of holding on to
/// candles, orders or positions between calls.
#[async_trait]
pub trait Strategy: Send {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Candles of history the strategy needs before its first `next`
    fn candles_needed(&self) -> usize {
        1
    }

    /// Called once after warm-up, before the first tick
    async fn setup(&mut self, _broker: &mut Broker, _symbol: &str) -> Result<(), StrategyError> {
        Ok(())
    }

    /// Called once per bar (backtest) or scheduling interval (live)
    async fn next(&mut self, broker: &mut Broker, symbol: &str) -> Result<(), StrategyError>;
}

/// A strategy bound to the symbol it trades
pub struct StrategyRegistration {
    pub symbol: String,
    pub strategy: Box<dyn Strategy>,
}

impl StrategyRegistration {
    pub fn new(symbol: impl Into<String>, strategy: Box<dyn Strategy>) -> Self {
        Self {
            symbol: symbol.into(),
            strategy,
        }
    }

    /// `strategy@symbol`, used in logs and error reports
    pub fn label(&self) -> String {
        format!("{}@{}", self.strategy.name(), self.symbol)
    }
}
