//! Risk management

use std::collections::BTreeMap;

use crate::error::BrokerError;
use crate::exchange::OrderRequest;
use crate::portfolio::AccountState;

/// Margin check applied before an order reaches the repository.
///
/// Exposure is the sum over symbols of `|net position + working entry orders| * price`.
#[derive(Debug, Clone)]
pub struct RiskManager {
    max_leverage: f64,
}

impl RiskManager {
    /// Create new risk manager
    pub fn new(max_leverage: f64) -> Self {
        Self { max_leverage }
    }

    pub fn max_leverage(&self) -> f64 {
        self.max_leverage
    }

    /// Gross exposure of the account, optionally with an extra signed quantity on one symbol.
    fn exposure(
        account: &AccountState,
        prices: &BTreeMap<String, f64>,
        extra: Option<(&str, f64)>,
    ) -> f64 {
        let mut net: BTreeMap<&str, f64> = BTreeMap::new();
        for (symbol, position) in &account.positions {
            *net.entry(symbol.as_str()).or_default() += position.signed_quantity();
        }
        // exit legs only ever reduce the position they protect
        for order in account.open_orders.values().filter(|o| o.parent_id.is_none()) {
            *net.entry(order.symbol.as_str()).or_default() += order.signed_quantity();
        }
        if let Some((symbol, qty)) = extra {
            *net.entry(symbol).or_default() += qty;
        }
        net.iter()
            .map(|(symbol, qty)| qty.abs() * prices.get(*symbol).copied().unwrap_or(0.0))
            .sum()
    }

    /// Reject the request if it would push projected exposure above `equity * max_leverage`.
    /// Requests that reduce exposure are always accepted.
    pub fn check_order(
        &self,
        account: &AccountState,
        request: &OrderRequest,
        prices: &BTreeMap<String, f64>,
    ) -> Result<(), BrokerError> {
        let mut prices = prices.clone();
        if let Some(price) = request.reference_price() {
            prices
                .entry(request.symbol.clone())
                .and_modify(|p| *p = p.max(price))
                .or_insert(price);
        }

        let before = Self::exposure(account, &prices, None);
        let signed = request.side.sign() * request.quantity;
        let after = Self::exposure(account, &prices, Some((&request.symbol, signed)));
        let available = account.equity.max(0.0) * self.max_leverage;

        if after > before && after > available + 1e-9 {
            return Err(BrokerError::InsufficientMargin {
                required: after,
                available,
            });
        }
        Ok(())
    }
}
