//! Strategy registry: named factories resolving a [`StrategySpec`] into a strategy

use std::collections::BTreeMap;

use crate::config::StrategySpec;
use crate::error::ConfigError;
use crate::strategy::{
    BuyAndHoldStrategy, RSIStrategy, RSIStrategyConfig, SmaCrossConfig, SmaCrossStrategy,
    Strategy, StrategyRegistration,
};

pub type StrategyFactory =
    Box<dyn Fn(&StrategySpec) -> Result<Box<dyn Strategy>, ConfigError> + Send + Sync>;

pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

fn invalid(spec: &StrategySpec, param: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidParameter {
        strategy: spec.kind.clone(),
        param: param.to_string(),
        reason: reason.to_string(),
    }
}

fn allocation(spec: &StrategySpec, default: f64) -> Result<f64, ConfigError> {
    let value = spec.param_f64("allocation", default);
    if value > 0.0 && value <= 1.0 {
        Ok(value)
    } else {
        Err(invalid(spec, "allocation", "must be within (0, 1]"))
    }
}

impl StrategyRegistry {
    /// Registry with the built-in strategies
    pub fn new() -> Self {
        let mut registry = Self {
            factories: BTreeMap::new(),
        };

        registry.register("rsi", |spec| {
            let defaults = RSIStrategyConfig::default();
            let config = RSIStrategyConfig {
                rsi_period: spec.param_usize("period", defaults.rsi_period),
                rsi_oversold: spec.param_f64("oversold", defaults.rsi_oversold),
                rsi_overbought: spec.param_f64("overbought", defaults.rsi_overbought),
                allocation: allocation(spec, defaults.allocation)?,
            };
            if config.rsi_period == 0 {
                return Err(invalid(spec, "period", "must be positive"));
            }
            if config.rsi_oversold >= config.rsi_overbought {
                return Err(invalid(spec, "oversold", "must be below overbought"));
            }
            Ok(Box::new(RSIStrategy::new(config)))
        });

        registry.register("sma_cross", |spec| {
            let defaults = SmaCrossConfig::default();
            let config = SmaCrossConfig {
                fast: spec.param_usize("fast", defaults.fast),
                slow: spec.param_usize("slow", defaults.slow),
                allocation: allocation(spec, defaults.allocation)?,
            };
            if config.fast == 0 || config.fast >= config.slow {
                return Err(invalid(spec, "fast", "must be positive and below slow"));
            }
            Ok(Box::new(SmaCrossStrategy::new(config)))
        });

        registry.register("buy_and_hold", |spec| {
            Ok(Box::new(BuyAndHoldStrategy::new(allocation(spec, 1.0)?)))
        });

        registry
    }

    /// Register a strategy factory
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&StrategySpec) -> Result<Box<dyn Strategy>, ConfigError> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_lowercase(), Box::new(factory));
    }

    /// Create a strategy instance from its spec
    pub fn create(&self, spec: &StrategySpec) -> Result<Box<dyn Strategy>, ConfigError> {
        let factory = self
            .factories
            .get(&spec.kind.to_lowercase())
            .ok_or_else(|| ConfigError::UnknownStrategy(spec.kind.clone()))?;
        factory(spec)
    }

    /// Resolve every spec into a registration, keeping spec order
    pub fn build_all(&self, specs: &[StrategySpec]) -> Result<Vec<StrategyRegistration>, ConfigError> {
        specs
            .iter()
            .map(|spec| Ok(StrategyRegistration::new(spec.symbol.clone(), self.create(spec)?)))
            .collect()
    }

    pub fn available(&self) -> Vec<String> {
        self.factories.keys().cloned().collect()
    }

    pub fn has_strategy(&self, kind: &str) -> bool {
        self.factories.contains_key(&kind.to_lowercase())
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn builds_builtins_with_params() {
        let registry = StrategyRegistry::new();
        assert_eq!(registry.available(), vec!["buy_and_hold", "rsi", "sma_cross"]);

        let spec = StrategySpec::new("RSI", "BTC/USDT").with_params(json!({"period": 7}));
        let strategy = registry.create(&spec).unwrap();
        assert_eq!(strategy.name(), "rsi");
        assert_eq!(strategy.candles_needed(), 21);
    }

    #[test]
    fn rejects_unknown_kind_and_bad_params() {
        let registry = StrategyRegistry::new();
        assert!(matches!(
            registry.create(&StrategySpec::new("martingale", "X")),
            Err(ConfigError::UnknownStrategy(_))
        ));
        let spec = StrategySpec::new("sma_cross", "X").with_params(json!({"fast": 50, "slow": 20}));
        assert!(matches!(
            registry.create(&spec),
            Err(ConfigError::InvalidParameter { .. })
        ));
    }
}
