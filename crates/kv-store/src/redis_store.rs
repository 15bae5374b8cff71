//! Redis-backed store
//!
//! Shares one multiplexed connection across all callers. Any command error
//! drops the cached connection so the next call reconnects; callers decide
//! whether to retry.

use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{BoxFuture, KvStore};

pub struct RedisStore {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl RedisStore {
    /// Create a store for the given Redis URL. Does not connect yet.
    pub fn open(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).map_err(|e| Error::Redis(e.to_string()))?;
        Ok(Self {
            client,
            connection: Mutex::new(None),
        })
    }

    /// Establish the connection and verify it with `PING`.
    pub async fn connect(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::Redis(format!("PING failed: {e}")))?;
        debug!(reply = %pong, "redis connection verified");
        Ok(())
    }

    /// Get the cached connection or open a new one.
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self
            .client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| Error::Redis(format!("connection failed: {e}")))?;
        *cached = Some(conn.clone());
        Ok(conn)
    }

    /// Forget the cached connection after a failure.
    async fn invalidate(&self, error: &redis::RedisError) {
        warn!(error = %error, "redis command failed, dropping connection");
        *self.connection.lock().await = None;
    }
}

impl KvStore for RedisStore {
    fn id(&self) -> &str {
        "redis"
    }

    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            match redis::cmd("GET")
                .arg(key)
                .query_async::<Option<String>>(&mut conn)
                .await
            {
                Ok(value) => Ok(value),
                Err(e) => {
                    self.invalidate(&e).await;
                    Err(Error::Redis(format!("GET {key} failed: {e}")))
                }
            }
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: String) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut conn = self.connection().await?;
            if let Err(e) = redis::cmd("SET")
                .arg(key)
                .arg(&value)
                .query_async::<()>(&mut conn)
                .await
            {
                self.invalidate(&e).await;
                return Err(Error::Redis(format!("SET {key} failed: {e}")));
            }
            Ok(())
        })
    }

    fn set_many(&self, entries: Vec<(String, String)>) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(());
            }
            let mut conn = self.connection().await?;
            let mut pipe = redis::pipe();
            for (key, value) in &entries {
                pipe.cmd("SET").arg(key).arg(value).ignore();
            }
            if let Err(e) = pipe.query_async::<()>(&mut conn).await {
                self.invalidate(&e).await;
                return Err(Error::Redis(format!("pipelined SET failed: {e}")));
            }
            debug!(entries = entries.len(), "redis pipeline flushed");
            Ok(())
        })
    }
}
