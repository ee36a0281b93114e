//! Bar-level fill rules for the backtest broker.
//!
//! Orders are matched against the first bar that follows their placement:
//!
//! - market orders (and armed stop / take-profit orders) fill at that bar's open
//! - limit orders fill when the bar's `[low, high]` contains the limit; buys at
//!   `min(limit, high)`, sells at `max(limit, low)`
//! - stop and take-profit orders arm on the bar that reaches their trigger and fill at
//!   the open of the following bar. Only one side of the bar is checked, so a bar that
//!   gaps through the trigger still arms the order.
//!
//! Within one bar, orders are evaluated market -> stop/take-profit -> limit, then by
//! creation order.

use crate::data::Candle;
use crate::exchange::{Order, OrderSide, OrderType};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FillDecision {
    Fill(f64),
    /// Trigger traded on this bar; fill on the next one
    Trigger,
    Wait,
}

/// Evaluation rank within a bar. Lower goes first.
pub fn rank(order: &Order) -> u8 {
    match order.order_type {
        OrderType::Market => 0,
        OrderType::Stop | OrderType::TakeProfit if order.triggered => 0,
        OrderType::Stop | OrderType::TakeProfit => 1,
        OrderType::Limit => 2,
    }
}

pub fn evaluate(order: &Order, bar: &Candle) -> FillDecision {
    match order.order_type {
        OrderType::Market => FillDecision::Fill(bar.open),
        OrderType::Stop | OrderType::TakeProfit if order.triggered => FillDecision::Fill(bar.open),
        OrderType::Stop | OrderType::TakeProfit if order.trigger_reached(bar) => FillDecision::Trigger,
        OrderType::Stop | OrderType::TakeProfit => FillDecision::Wait,
        OrderType::Limit => match order.price {
            Some(limit) if bar.contains(limit) => {
                let price = match order.side {
                    OrderSide::Buy => limit.min(bar.high),
                    OrderSide::Sell => limit.max(bar.low),
                };
                FillDecision::Fill(price)
            }
            _ => FillDecision::Wait,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::OrderRequest;
    use chrono::Utc;

    fn bar() -> Candle {
        Candle::new(Utc::now(), 104.0, 110.0, 100.0, 106.0, 1.0)
    }

    fn gap_down() -> Candle {
        Candle::new(Utc::now(), 95.0, 96.0, 90.0, 92.0, 1.0)
    }

    fn order(request: OrderRequest) -> Order {
        Order::from_request("bt-000000001".to_string(), &request, Utc::now())
    }

    #[test]
    fn buy_limit_inside_range_fills_at_limit() {
        let o = order(OrderRequest::limit("SYM", OrderSide::Buy, 1.0, 105.0));
        assert_eq!(evaluate(&o, &bar()), FillDecision::Fill(105.0));
    }

    #[test]
    fn buy_limit_above_high_waits() {
        let o = order(OrderRequest::limit("SYM", OrderSide::Buy, 1.0, 115.0));
        assert_eq!(evaluate(&o, &bar()), FillDecision::Wait);
    }

    #[test]
    fn buy_limit_below_low_waits() {
        let o = order(OrderRequest::limit("SYM", OrderSide::Buy, 1.0, 98.0));
        assert_eq!(evaluate(&o, &bar()), FillDecision::Wait);
    }

    #[test]
    fn stop_arms_then_fills_at_next_open() {
        let mut o = order(OrderRequest::stop("SYM", OrderSide::Sell, 1.0, 101.0));
        assert_eq!(rank(&o), 1);
        assert_eq!(evaluate(&o, &bar()), FillDecision::Trigger);

        o.triggered = true;
        assert_eq!(rank(&o), 0);
        assert_eq!(evaluate(&o, &bar()), FillDecision::Fill(104.0));
    }

    #[test]
    fn sell_stop_arms_when_bar_gaps_below_trigger() {
        let o = order(OrderRequest::stop("SYM", OrderSide::Sell, 1.0, 101.0));
        assert_eq!(evaluate(&o, &gap_down()), FillDecision::Trigger);
    }

    #[test]
    fn buy_stop_ignores_bars_below_trigger() {
        let o = order(OrderRequest::stop("SYM", OrderSide::Buy, 1.0, 101.0));
        assert_eq!(evaluate(&o, &gap_down()), FillDecision::Wait);
        assert_eq!(evaluate(&o, &bar()), FillDecision::Trigger);
    }

    #[test]
    fn take_profit_triggers_on_the_favourable_side() {
        let sell_tp = order(OrderRequest::take_profit("SYM", OrderSide::Sell, 1.0, 108.0));
        assert_eq!(evaluate(&sell_tp, &bar()), FillDecision::Trigger);
        assert_eq!(evaluate(&sell_tp, &gap_down()), FillDecision::Wait);

        let buy_tp = order(OrderRequest::take_profit("SYM", OrderSide::Buy, 1.0, 97.0));
        assert_eq!(evaluate(&buy_tp, &bar()), FillDecision::Wait);
        assert_eq!(evaluate(&buy_tp, &gap_down()), FillDecision::Trigger);
        assert_eq!(rank(&buy_tp), 1);
    }

    #[test]
    fn stops_rank_ahead_of_limits() {
        let stop = order(OrderRequest::stop("SYM", OrderSide::Sell, 1.0, 101.0));
        let limit = order(OrderRequest::limit("SYM", OrderSide::Buy, 1.0, 101.0));
        let market = order(OrderRequest::market("SYM", OrderSide::Buy, 1.0));
        assert!(rank(&market) < rank(&stop));
        assert!(rank(&stop) < rank(&limit));
    }
}
