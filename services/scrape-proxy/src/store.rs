//! Ledger store construction

use std::sync::Arc;

use kv_store::{FileStore, KvStore, MemoryStore, RedisStore};
use tracing::info;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::{Error, Result};

/// Open the configured store backend and verify it is reachable.
///
/// `StoreConnect` errors are worth retrying; `StoreConfig` errors are not.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn KvStore>> {
    match config.backend {
        StoreBackend::Memory => {
            info!("using in-memory ledger store, quota state will not survive restart");
            Ok(Arc::new(MemoryStore::new()))
        }
        StoreBackend::File => {
            let path = config
                .path
                .clone()
                .ok_or_else(|| Error::StoreConfig("store.path is not set".into()))?;
            let store = FileStore::load(path).await?;
            Ok(Arc::new(store))
        }
        StoreBackend::Redis => {
            let url = config
                .url
                .as_deref()
                .ok_or_else(|| Error::StoreConfig("store.url is not set".into()))?;
            let store = RedisStore::open(url).map_err(|e| Error::StoreConfig(e.to_string()))?;
            store.connect().await?;
            Ok(Arc::new(store))
        }
    }
}
