//! Error taxonomy shared by repositories, brokers, strategies and the execution loop.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::execution::HandlerState;

/// Failure families reported upstream. Serialised into error status messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    TransientRepository,
    OrderNotFound,
    InvalidOrder,
    InsufficientMargin,
    InsufficientHistory,
    Strategy,
    ChannelDelivery,
    ProcessCrash,
    Configuration,
}

/// Errors surfaced by a [`Repository`](crate::repository::Repository).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RepositoryError {
    /// Retry budget exhausted on a retryable failure.
    #[error("transient repository failure after {attempts} attempt(s): {message}")]
    Transient { attempts: u32, message: String },
    #[error("order not found: {0}")]
    OrderNotFound(String),
    #[error("order rejected: {0}")]
    Rejected(String),
    #[error("unknown symbol: {0}")]
    UnknownSymbol(String),
}

impl RepositoryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::TransientRepository,
            Self::OrderNotFound(_) => ErrorKind::OrderNotFound,
            Self::Rejected(_) | Self::UnknownSymbol(_) => ErrorKind::InvalidOrder,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }
}

/// Errors surfaced by a [`Broker`](crate::broker::Broker).
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BrokerError {
    #[error("invalid order: {0}")]
    InvalidOrder(String),
    #[error("insufficient margin: projected exposure {required:.4} exceeds limit {available:.4}")]
    InsufficientMargin { required: f64, available: f64 },
    #[error("insufficient history for {symbol}: need {needed} candles, have {available}")]
    InsufficientHistory {
        symbol: String,
        needed: usize,
        available: usize,
    },
    #[error("initial data already prepared for this session")]
    AlreadyPrepared,
    #[error(transparent)]
    Repository(#[from] RepositoryError),
}

impl BrokerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidOrder(_) | Self::AlreadyPrepared => ErrorKind::InvalidOrder,
            Self::InsufficientMargin { .. } => ErrorKind::InsufficientMargin,
            Self::InsufficientHistory { .. } => ErrorKind::InsufficientHistory,
            Self::Repository(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Repository(e) if e.is_retryable())
    }
}

/// Errors raised from inside a strategy call. Never fatal to the handler.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StrategyError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error("{0}")]
    Logic(String),
}

impl StrategyError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Strategy
    }

    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Errors that end an execution handler run.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("no strategies registered")]
    NoStrategies,
    #[error("invalid handler transition from {from:?} to {to:?}")]
    InvalidState { from: HandlerState, to: HandlerState },
    #[error(transparent)]
    Broker(#[from] BrokerError),
}

impl ExecutionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NoStrategies | Self::InvalidState { .. } => ErrorKind::Configuration,
            Self::Broker(e) => e.kind(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Broker(e) if e.is_retryable())
    }
}

/// Invalid or incomplete session configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown strategy kind: {0}")]
    UnknownStrategy(String),
    #[error("invalid parameter `{param}` for strategy {strategy}: {reason}")]
    InvalidParameter {
        strategy: String,
        param: String,
        reason: String,
    },
    #[error("no dataset configured for symbol {0}")]
    MissingDataset(String),
    #[error("invalid session config: {0}")]
    Invalid(String),
}

/// Errors raised while loading candle datasets.
#[derive(Debug, Error)]
pub enum DataError {
    #[error("failed to read dataset {path}: {source}")]
    Csv {
        path: String,
        #[source]
        source: csv::Error,
    },
    #[error("invalid timestamp `{0}`")]
    Timestamp(String),
}

/// Errors raised while assembling a session from its configuration.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Data(#[from] DataError),
}

impl BuildError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Configuration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broker_error_kinds_follow_the_repository_cause() {
        let transient = BrokerError::from(RepositoryError::Transient {
            attempts: 5,
            message: "timeout".to_string(),
        });
        assert_eq!(transient.kind(), ErrorKind::TransientRepository);
        assert!(transient.is_retryable());

        let missing = BrokerError::from(RepositoryError::OrderNotFound("bt-1".to_string()));
        assert_eq!(missing.kind(), ErrorKind::OrderNotFound);
        assert!(!missing.is_retryable());
    }

    #[test]
    fn error_kind_serialises_snake_case() {
        let json = serde_json::to_string(&ErrorKind::InsufficientHistory).unwrap();
        assert_eq!(json, "\"insufficient_history\"");
    }
}
