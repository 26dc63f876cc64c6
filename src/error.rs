//! Error types for gator.

use reqwest::StatusCode;
use thiserror::Error;

/// Failure while retrieving or parsing a remote feed.
#[derive(Error, Debug)]
pub enum FetchError {
    /// The request could not be sent or the body could not be read.
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// The server answered with a non-success status.
    #[error("HTTP error: {0}")]
    Status(StatusCode),

    /// The body is not a well-formed feed.
    #[error("failed to parse feed: {0}")]
    Parse(#[from] feed_rs::parser::ParseFeedError),
}

/// Common error type for gator.
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid command line argument.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// A unique key already exists.
    #[error("{0} already exists")]
    Conflict(String),

    /// Feed retrieval error.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// Database error.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error is a duplicate-key conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

/// Map a sqlx error to [`Error::Conflict`] when it is a unique violation.
pub(crate) fn conflict_or(err: sqlx::Error, what: impl Into<String>) -> Error {
    match &err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            Error::Conflict(what.into())
        }
        _ => Error::Database(err),
    }
}

/// Result type alias for gator operations.
pub type Result<T> = std::result::Result<T, Error>;
