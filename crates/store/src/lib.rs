//! SQLite-backed persistence for the engine.
//!
//! One table family per module; every function takes a `&Connection` so it
//! composes inside the single transaction that [`Database::with_tx`] opens
//! per logical action.

pub mod campaigns;
pub mod catalog;
pub mod configs;
pub mod db;
pub mod events;
pub mod executions;
pub mod schema;
pub mod segments;
pub mod users;

pub use db::Database;
