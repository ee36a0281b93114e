//! Exchange integration module
//!
//! Orders, the exchange connector boundary and the in-process paper connector.

pub mod connector;
pub mod order;
pub mod paper;

pub use connector::*;
pub use order::*;
pub use paper::*;
