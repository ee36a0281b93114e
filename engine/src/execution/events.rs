//! Events emitted by a running handler

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backtest::BacktestReport;
use crate::error::ErrorKind;
use crate::exchange::Order;
use crate::portfolio::{AccountState, Fill};

/// Handler lifecycle: `Idle -> Running -> {Stopping -> Stopped, Crashed}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandlerState {
    Idle,
    Running,
    Stopping,
    Stopped,
    Crashed,
}

impl HandlerState {
    pub fn can_transition_to(&self, next: HandlerState) -> bool {
        use HandlerState::*;
        matches!(
            (self, next),
            (Idle, Running) | (Idle, Crashed) | (Running, Stopping) | (Running, Crashed) | (Stopping, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Crashed)
    }
}

/// Requests served by the handler at the next tick boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerRequest {
    Snapshot,
}

/// Outcome of a finished run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub state: HandlerState,
    pub ticks: u64,
    pub account: AccountState,
    /// Every order mutation in the order it happened
    pub orders: Vec<Order>,
    pub fills: Vec<Fill>,
    /// Present for backtest sessions
    pub report: Option<BacktestReport>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    StateChanged {
        from: HandlerState,
        to: HandlerState,
    },
    OrderUpdate(Order),
    /// A strategy call failed; reported once per distinct failure
    StrategyError {
        strategy: String,
        symbol: String,
        message: String,
    },
    /// Live refresh failed with a retryable error; reported once per outage
    DataError {
        kind: ErrorKind,
        message: String,
    },
    Snapshot {
        at: DateTime<Utc>,
        account: AccountState,
    },
    /// Terminal: graceful stop or data exhausted
    Finished(Box<RunSummary>),
    /// Terminal: unrecoverable failure
    Crashed {
        kind: ErrorKind,
        message: String,
    },
}

impl ExecutionEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished(_) | Self::Crashed { .. })
    }
}
