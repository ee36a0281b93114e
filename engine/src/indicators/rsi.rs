//! Relative Strength Index

use ta::indicators::RelativeStrengthIndex;

use super::{run_series, Warmed};

pub type Rsi = Warmed<RelativeStrengthIndex>;

/// RSI over `period` price changes, ready from the `period + 1`-th close
pub fn rsi(period: usize) -> ta::errors::Result<Rsi> {
    Ok(Warmed::new("RSI", RelativeStrengthIndex::new(period)?, period + 1))
}

pub fn calculate_rsi(values: &[f64], period: usize) -> ta::errors::Result<Vec<Option<f64>>> {
    Ok(run_series(&mut rsi(period)?, values))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::Indicator;

    #[test]
    fn needs_one_more_close_than_the_period() {
        let mut indicator = rsi(14).unwrap();
        for value in (0..14).map(|i| 100.0 + i as f64) {
            indicator.update(value);
        }
        assert!(!indicator.is_ready());
        indicator.update(120.0);
        assert!(indicator.is_ready());
    }

    #[test]
    fn falling_prices_push_rsi_down() {
        let values: Vec<f64> = (0..30).map(|i| 100.0 - i as f64).collect();
        let series = calculate_rsi(&values, 5).unwrap();
        let last = series.last().copied().flatten().unwrap();
        assert!(last < 30.0);
    }

    #[test]
    fn zero_period_is_rejected() {
        assert!(rsi(0).is_err());
    }
}
