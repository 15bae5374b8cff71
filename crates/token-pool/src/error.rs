//! Error types for scheduling operations

use chrono::{DateTime, Utc};
use upstream::UpstreamError;

/// Errors from ledger, ladder, and dispatch operations.
///
/// Quota, concurrency, and rate-limit errors are recovered inside the
/// dispatcher by moving on to another credential; callers only ever see
/// `Outbound`, `PoolEmpty`, `QueueFull`, or `Abandoned`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("credential {0} has exhausted its quota")]
    QuotaExceeded(String),

    #[error("credential {0} is at its concurrency limit")]
    ConcurrencyExceeded(String),

    #[error("credential {credential_id} rate limited until {until}")]
    RateLimited {
        credential_id: String,
        until: DateTime<Utc>,
    },

    #[error("outbound call failed: {0}")]
    Outbound(#[from] UpstreamError),

    #[error("no credential available")]
    NoCredentialAvailable,

    #[error("no credentials configured and no fallback backend")]
    PoolEmpty,

    #[error("unknown credential: {0}")]
    UnknownCredential(String),

    #[error("pending queue is full ({0} waiting)")]
    QueueFull(usize),

    #[error("request dropped before a response was produced")]
    Abandoned,

    #[error("ledger store error: {0}")]
    Store(String),

    #[error("invalid ladder: {0}")]
    InvalidLadder(String),
}

impl Error {
    /// HTTP status to report to the caller, mirrored from the failing
    /// outbound call where one exists.
    pub fn status(&self) -> Option<u16> {
        match self {
            Error::Outbound(e) => e.status(),
            Error::QueueFull(_) => Some(503),
            _ => None,
        }
    }
}

impl From<kv_store::Error> for Error {
    fn from(e: kv_store::Error) -> Self {
        Error::Store(e.to_string())
    }
}

/// Result alias for scheduling operations.
pub type Result<T> = std::result::Result<T, Error>;
