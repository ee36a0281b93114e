//! Backtest performance metrics

use crate::broker::EquityPoint;
use crate::portfolio::Fill;

/// Calculate metrics from fills and the equity curve
pub struct MetricsCalculator;

impl MetricsCalculator {
    /// Fills that reduced or closed a position, i.e. completed round trips
    pub fn closing_fills(fills: &[Fill]) -> impl Iterator<Item = &Fill> {
        fills.iter().filter(|f| f.realized_pnl != 0.0)
    }

    /// Gross profit over gross loss of closed trades. 0 without losses.
    pub fn profit_factor(fills: &[Fill]) -> f64 {
        let (profit, loss) = Self::closing_fills(fills).fold((0.0, 0.0), |(p, l), f| {
            if f.realized_pnl > 0.0 {
                (p + f.realized_pnl, l)
            } else {
                (p, l - f.realized_pnl)
            }
        });
        if loss == 0.0 {
            return 0.0;
        }
        profit / loss
    }

    /// Percentage of closed trades with positive P&L
    pub fn win_rate(fills: &[Fill]) -> f64 {
        let (wins, total) = Self::closing_fills(fills).fold((0usize, 0usize), |(w, t), f| {
            (w + usize::from(f.realized_pnl > 0.0), t + 1)
        });
        if total == 0 {
            return 0.0;
        }
        wins as f64 / total as f64 * 100.0
    }

    /// Largest peak-to-trough equity decline as a fraction of the peak
    pub fn max_drawdown(equity: &[EquityPoint]) -> f64 {
        let mut peak = f64::MIN;
        let mut worst = 0.0_f64;
        for point in equity {
            peak = peak.max(point.equity);
            if peak > 0.0 {
                worst = worst.max((peak - point.equity) / peak);
            }
        }
        worst
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OrderSide;
    use chrono::{TimeZone, Utc};

    fn fill(pnl: f64) -> Fill {
        Fill {
            order_id: "bt-1".to_string(),
            symbol: "SYM".to_string(),
            side: OrderSide::Sell,
            quantity: 1.0,
            price: 1.0,
            fee: 0.0,
            realized_pnl: pnl,
            timestamp: Utc::now(),
            strategy: None,
        }
    }

    #[test]
    fn trade_statistics() {
        let fills = vec![fill(0.0), fill(30.0), fill(-10.0), fill(10.0)];
        assert_eq!(MetricsCalculator::profit_factor(&fills), 4.0);
        assert!((MetricsCalculator::win_rate(&fills) - 66.666).abs() < 0.01);
    }

    #[test]
    fn drawdown_from_peak() {
        let curve: Vec<EquityPoint> = [100.0, 120.0, 90.0, 130.0]
            .iter()
            .enumerate()
            .map(|(i, e)| EquityPoint {
                timestamp: Utc.timestamp_opt(i as i64, 0).unwrap(),
                equity: *e,
            })
            .collect();
        assert!((MetricsCalculator::max_drawdown(&curve) - 0.25).abs() < 1e-12);
    }
}
