//! Error types for mailsink

use thiserror::Error;

/// Main error type for mailsink
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),

    #[error("message too large")]
    TooLarge,

    #[error("rate limited")]
    RateLimited,

    #[error("spool error: {0}")]
    Spool(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("object store error: {0}")]
    ObjectStore(String),

    #[error("publish error: {0}")]
    Publish(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for mailsink
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the error is the spool's size-limit rejection.
    pub fn is_too_large(&self) -> bool {
        matches!(self, Error::TooLarge)
    }
}
