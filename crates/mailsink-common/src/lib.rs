//! Mailsink common - configuration, errors and shared types
//!
//! This crate holds everything the other mailsink crates share:
//! environment-driven configuration, the error enum, and the small set of
//! domain types that cross crate boundaries.

pub mod config;
pub mod error;
pub mod types;

pub use error::{Error, Result};
