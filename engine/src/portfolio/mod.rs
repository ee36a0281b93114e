//! Portfolio management module

pub mod account;
pub mod position;
pub mod risk;

pub use account::*;
pub use position::*;
pub use risk::*;
