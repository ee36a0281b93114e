//! Simple moving average

use ta::indicators::SimpleMovingAverage;

use super::{run_series, Warmed};

pub type Sma = Warmed<SimpleMovingAverage>;

pub fn sma(period: usize) -> ta::errors::Result<Sma> {
    Ok(Warmed::new("SMA", SimpleMovingAverage::new(period)?, period))
}

pub fn calculate_sma(values: &[f64], period: usize) -> ta::errors::Result<Vec<Option<f64>>> {
    Ok(run_series(&mut sma(period)?, values))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn averages_last_period_values() {
        let series = calculate_sma(&[1.0, 2.0, 3.0, 4.0], 3).unwrap();
        assert_eq!(series, vec![None, None, Some(2.0), Some(3.0)]);
    }

    #[test]
    fn warmup_matches_period() {
        assert_eq!(sma(7).unwrap().warmup(), 7);
    }
}
