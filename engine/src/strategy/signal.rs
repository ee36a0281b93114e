//! Trading signals and their translation into orders

use crate::broker::Broker;
use crate::error::StrategyError;
use crate::exchange::{Order, OrderRequest, OrderSide};

/// Signal type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalType {
    /// Enter long
    Buy,
    /// Exit long
    Sell,
    /// No action
    Hold,
}

/// Trading signal
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub signal_type: SignalType,
    /// Reason for signal
    pub reason: String,
}

impl Signal {
    pub fn buy(reason: impl Into<String>) -> Self {
        Self {
            signal_type: SignalType::Buy,
            reason: reason.into(),
        }
    }

    pub fn sell(reason: impl Into<String>) -> Self {
        Self {
            signal_type: SignalType::Sell,
            reason: reason.into(),
        }
    }

    pub fn hold(reason: impl Into<String>) -> Self {
        Self {
            signal_type: SignalType::Hold,
            reason: reason.into(),
        }
    }
}

/// Turn a long-only signal into orders.
///
/// `Buy` opens a position sized at `allocation * equity` when flat with nothing working,
/// `Sell` closes an open long. Anything else is a no-op.
pub async fn apply_signal(
    broker: &mut Broker,
    symbol: &str,
    signal: &Signal,
    allocation: f64,
    strategy: &str,
) -> Result<Option<Order>, StrategyError> {
    let position = broker.get_position(symbol);
    let working = broker.open_orders().iter().any(|o| o.symbol == symbol);

    match signal.signal_type {
        SignalType::Buy if position.is_none() && !working => {
            let price = broker
                .last_price(symbol)
                .ok_or_else(|| StrategyError::Logic(format!("no price for {}", symbol)))?;
            let quantity = broker.get_equity() * allocation / price;
            if !(quantity.is_finite() && quantity > 0.0) {
                return Ok(None);
            }
            let request = OrderRequest::market(symbol, OrderSide::Buy, quantity).with_strategy(strategy);
            Ok(Some(broker.place_order(request).await?))
        }
        SignalType::Sell if position.is_some_and(|p| p.signed_quantity() > 0.0) && !working => {
            Ok(broker.close_position(symbol).await?)
        }
        _ => Ok(None),
    }
}
