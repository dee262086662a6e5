//! API handlers.

pub mod auth;
pub mod health;

/// Optional database pool shared with handlers that report on storage.
/// `None` when the service runs on in-memory stores.
#[derive(Clone, Debug, Default)]
pub struct Storage(pub Option<sqlx::PgPool>);
