//! Buy once, hold until the session ends

use async_trait::async_trait;

use crate::broker::Broker;
use crate::error::StrategyError;
use crate::strategy::{apply_signal, Signal, Strategy};

pub struct BuyAndHoldStrategy {
    allocation: f64,
}

impl BuyAndHoldStrategy {
    pub fn new(allocation: f64) -> Self {
        Self { allocation }
    }
}

#[async_trait]
impl Strategy for BuyAndHoldStrategy {
    fn name(&self) -> &str {
        "buy_and_hold"
    }

    async fn next(&mut self, broker: &mut Broker, symbol: &str) -> Result<(), StrategyError> {
        // apply_signal skips when a position or working order already exists
        let signal = Signal::buy("hold from first bar");
        apply_signal(broker, symbol, &signal, self.allocation, self.name()).await?;
        Ok(())
    }
}
