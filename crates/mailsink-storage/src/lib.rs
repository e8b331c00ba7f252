//! Mailsink storage - index database and object store
//!
//! This crate provides the two durable stores behind the spool: the SQLite
//! message/event index and the S3-compatible object store that holds
//! replicated bodies.

pub mod index;
pub mod object;

pub use index::{EventRow, IndexDb, MessageRow};
pub use object::ObjectStore;
