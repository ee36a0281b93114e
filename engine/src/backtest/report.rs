//! Backtest report generation

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backtest::MetricsCalculator;
use crate::broker::EquityPoint;
use crate::portfolio::{AccountState, Fill};

/// Backtest report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestReport {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub start_equity: f64,
    pub end_equity: f64,
    pub total_return: f64,
    pub total_return_percent: f64,
    pub num_fills: usize,
    pub round_trips: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub max_drawdown: f64,
    pub fees_paid: f64,
}

impl BacktestReport {
    /// Create a report from the final account, the fills and the equity curve
    pub fn from_run(
        initial_balance: f64,
        account: &AccountState,
        fills: &[Fill],
        equity: &[EquityPoint],
    ) -> Self {
        let closing: Vec<&Fill> = MetricsCalculator::closing_fills(fills).collect();
        let winning_trades = closing.iter().filter(|f| f.realized_pnl > 0.0).count();
        let total_return = account.equity - initial_balance;

        Self {
            start: equity.first().map(|p| p.timestamp),
            end: equity.last().map(|p| p.timestamp),
            start_equity: initial_balance,
            end_equity: account.equity,
            total_return,
            total_return_percent: if initial_balance > 0.0 {
                total_return / initial_balance * 100.0
            } else {
                0.0
            },
            num_fills: fills.len(),
            round_trips: closing.len(),
            winning_trades,
            losing_trades: closing.len() - winning_trades,
            win_rate: MetricsCalculator::win_rate(fills),
            profit_factor: MetricsCalculator::profit_factor(fills),
            max_drawdown: MetricsCalculator::max_drawdown(equity),
            fees_paid: account.fees_paid,
        }
    }

    /// Format report as string
    pub fn format(&self) -> String {
        let period = match (self.start, self.end) {
            (Some(start), Some(end)) => format!("{} -> {}", start.format("%Y-%m-%d %H:%M"), end.format("%Y-%m-%d %H:%M")),
            _ => "no bars".to_string(),
        };
        format!(
            r#"
Backtest Results
================
Period: {}
Starting Equity: ${:.2}
Ending Equity: ${:.2}
Total Return: ${:.2} ({:.2}%)
Fills: {}
Closed Trades: {}
Winning Trades: {}
Losing Trades: {}
Win Rate: {:.2}%
Profit Factor: {:.2}
Maximum Drawdown: {:.2}%
Fees Paid: ${:.2}
"#,
            period,
            self.start_equity,
            self.end_equity,
            self.total_return,
            self.total_return_percent,
            self.num_fills,
            self.round_trips,
            self.winning_trades,
            self.losing_trades,
            self.win_rate,
            self.profit_factor,
            self.max_drawdown * 100.0,
            self.fees_paid,
        )
    }
}
