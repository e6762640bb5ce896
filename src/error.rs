use std::error::Error as StdError;

use thiserror::Error;

/// Longhand's crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Longhand's crate-wide error type.
///
/// This is intentionally decoupled from `anyhow` so downstream libraries aren't forced to
/// adopt `anyhow` in their own public APIs.
#[derive(Debug, Error)]
pub enum Error {
    /// A job, sub-job, or stored object could not be found under its key.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller supplied a request the pipeline refuses to start.
    #[error("{0}")]
    Validation(String),

    /// A key-value or blob store operation failed.
    #[error("store error: {0}")]
    Store(String),

    #[error("{0}")]
    Message(String),

    #[error(transparent)]
    Other(#[from] Box<dyn StdError + Send + Sync>),
}

impl Error {
    pub(crate) fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Message(format!("{err:#}"))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Other(Box::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Other(Box::new(err))
    }
}
