//! Service-specific error types

use thiserror::Error;

/// Scrape proxy lifecycle errors.
///
/// Per-request errors (outbound failures, queue full, missing `url`) are
/// handled directly by the fetch handler as HTTP responses and never
/// propagate as Rust errors.
#[derive(Error, Debug)]
#[allow(clippy::enum_variant_names)]
pub enum Error {
    /// Store settings that no retry can fix (bad URL, corrupt ledger file)
    #[error("Ledger store misconfigured: {0}")]
    StoreConfig(String),

    /// Store unreachable; retried with backoff
    #[error("Ledger store connection failed: {0}")]
    StoreConnect(String),
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

impl From<kv_store::Error> for Error {
    fn from(e: kv_store::Error) -> Self {
        match e {
            kv_store::Error::Parse(msg) => Error::StoreConfig(msg),
            kv_store::Error::Io(msg) | kv_store::Error::Redis(msg) => Error::StoreConnect(msg),
        }
    }
}
