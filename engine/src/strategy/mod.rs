//! Strategy engine module
//!
//! Strategy contract, signals, the named-factory registry and built-in strategies.

pub mod base;
pub mod implementations;
pub mod registry;
pub mod signal;

pub use base::*;
pub use implementations::*;
pub use registry::*;
pub use signal::*;
