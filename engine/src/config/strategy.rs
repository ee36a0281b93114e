//! Strategy configuration

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One strategy bound to one symbol, resolved by the
/// [`StrategyRegistry`](crate::strategy::StrategyRegistry) at session build time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    /// Registry key (e.g., "rsi", "sma_cross", "buy_and_hold")
    pub kind: String,
    /// Symbol the strategy trades (e.g., "BTC/USDT")
    pub symbol: String,
    /// Strategy-specific parameters; missing keys fall back to the strategy defaults
    #[serde(default)]
    pub params: Value,
}

impl StrategySpec {
    pub fn new(kind: impl Into<String>, symbol: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            symbol: symbol.into(),
            params: Value::Null,
        }
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Read a numeric parameter, falling back to `default` when absent.
    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.params
            .get(key)
            .and_then(Value::as_f64)
            .unwrap_or(default)
    }

    /// Read an integer parameter, falling back to `default` when absent.
    pub fn param_usize(&self, key: &str, default: usize) -> usize {
        self.params
            .get(key)
            .and_then(Value::as_u64)
            .map(|v| v as usize)
            .unwrap_or(default)
    }
}
