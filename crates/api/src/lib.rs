//! HTTP layer: bearer-authenticated JSON API under `/api`.

pub mod auth;
pub mod envelope;
pub mod handlers;
pub mod router;

pub use handlers::ApiState;
pub use router::router;
