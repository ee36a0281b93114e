//! Technical indicators on top of the `ta` crate.
//!
//! `ta` indicators emit a value from the first input on; [`Warmed`] holds values back
//! until the indicator has seen its full window, so strategies never act on a
//! half-initialised reading.

pub mod rsi;
pub mod sma;

pub use rsi::*;
pub use sma::*;

use ta::Next;

/// Indicator trait for all indicators
pub trait Indicator {
    fn name(&self) -> &str;

    /// Feed the next close
    fn update(&mut self, value: f64);

    /// Latest value, `None` until ready
    fn value(&self) -> Option<f64>;

    fn is_ready(&self) -> bool;
}

/// A `ta` indicator that reports only after `warmup` inputs
#[derive(Debug, Clone)]
pub struct Warmed<T> {
    name: &'static str,
    inner: T,
    warmup: usize,
    seen: usize,
    last: Option<f64>,
}

impl<T> Warmed<T> {
    pub fn new(name: &'static str, inner: T, warmup: usize) -> Self {
        Self {
            name,
            inner,
            warmup: warmup.max(1),
            seen: 0,
            last: None,
        }
    }

    /// Inputs needed before the first value
    pub fn warmup(&self) -> usize {
        self.warmup
    }
}

impl<T: Next<f64, Output = f64>> Indicator for Warmed<T> {
    fn name(&self) -> &str {
        self.name
    }

    fn update(&mut self, value: f64) {
        let out = self.inner.next(value);
        self.seen += 1;
        if self.seen >= self.warmup {
            self.last = Some(out);
        }
    }

    fn value(&self) -> Option<f64> {
        self.last
    }

    fn is_ready(&self) -> bool {
        self.seen >= self.warmup
    }
}

/// Feed every value through `indicator`, collecting the value after each update
pub fn run_series<I: Indicator>(indicator: &mut I, values: &[f64]) -> Vec<Option<f64>> {
    values
        .iter()
        .map(|&v| {
            indicator.update(v);
            indicator.value()
        })
        .collect()
}
