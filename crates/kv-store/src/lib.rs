//! Durable key-value backends for the credential ledger
//!
//! The ledger only needs three operations: `get`, `set`, and a batched
//! `set_many` used by the periodic flush. Each backend is a deployment choice
//! behind the same `KvStore` trait:
//! - `MemoryStore`: process-local, nothing survives a restart
//! - `FileStore`: one JSON file, atomic temp-file + rename writes
//! - `RedisStore`: shared Redis, pipelined batch writes

pub mod error;
pub mod file;
pub mod memory;
pub mod redis_store;

pub use error::{Error, Result};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

use std::future::Future;
use std::pin::Pin;

/// Boxed future returned by `KvStore` methods (keeps the trait dyn-compatible).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// String key-value store used to mirror ledger state.
pub trait KvStore: Send + Sync {
    /// Backend name for logging ("memory", "file", "redis")
    fn id(&self) -> &str;

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>>;

    /// Write several entries in one round trip.
    fn set_many(&self, entries: Vec<(String, String)>) -> BoxFuture<'_, Result<()>>;
}
