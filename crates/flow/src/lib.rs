//! The periodic flow executor.

mod executor;

pub use executor::{FlowExecutor, TickStats};
