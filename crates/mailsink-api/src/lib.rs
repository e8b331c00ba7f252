//! Mailsink API - read-only admin HTTP endpoints
//!
//! Serves message listings and raw bodies straight off the index database
//! and the spool/object store. Localhost-only by default; gated by a
//! shared-secret header when a key is configured.

pub mod auth;
pub mod handlers;
pub mod routes;

pub use auth::AppState;
pub use routes::create_router;
