//! Direct target fetch: plain GET with no credential.

use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use crate::{BoxFuture, Result, TargetFetcher, UpstreamError, read_body};

/// Fetches the target URL as-is. Cheapest path, tried before any credential.
pub struct DirectClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl DirectClient {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

impl TargetFetcher for DirectClient {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            debug!(url, "direct fetch");
            let response = self
                .client
                .get(url)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(UpstreamError::from_reqwest)?;
            read_body(response).await
        })
    }
}
