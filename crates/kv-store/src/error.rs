//! Error types for store operations

/// Errors from a durable store backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("store parse error: {0}")]
    Parse(String),

    #[error("redis error: {0}")]
    Redis(String),
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;
