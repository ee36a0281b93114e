pub mod account_snapshots;
pub mod order_history;
