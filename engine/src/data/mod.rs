//! Data management module
//!
//! Handles OHLCV candle series, timeframes, in-memory storage and CSV datasets.

pub mod candle;
pub mod loader;
pub mod storage;
pub mod timeframe;

pub use candle::*;
pub use loader::*;
pub use storage::*;
pub use timeframe::*;
