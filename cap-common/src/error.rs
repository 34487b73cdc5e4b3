//! Common error types for the cap engine

use thiserror::Error;

/// Common result type for cap engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the cap engine crates
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation error (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error (malformed seed data, empty registry)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Requested resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Work queue operation failed (bad payload, lost job)
    #[error("Queue error: {0}")]
    Queue(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// True for infrastructure failures that a retry may resolve
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Database(_) | Error::Io(_) | Error::Queue(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Queue(format!("Job payload serialization failed: {}", err))
    }
}

impl From<uuid::Error> for Error {
    fn from(err: uuid::Error) -> Self {
        Error::Internal(format!("Invalid UUID in database: {}", err))
    }
}

impl From<rust_decimal::Error> for Error {
    fn from(err: rust_decimal::Error) -> Self {
        Error::Internal(format!("Invalid decimal in database: {}", err))
    }
}
