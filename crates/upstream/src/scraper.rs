//! Credentialed scraping service client.
//!
//! Issues `GET <base_url>?<key_param>=<api key>&url=<target>&<tier params>`.
//! The service answers 429 when the credential is rate limited.

use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

use crate::{BoxFuture, Result, ScrapeBackend, UpstreamError, read_body};

/// Query parameter carrying the API key, as ScraperAPI names it.
pub const DEFAULT_KEY_PARAM: &str = "api_key";

pub struct ScraperApiClient {
    client: reqwest::Client,
    base_url: String,
    key_param: String,
    timeout: Duration,
}

impl ScraperApiClient {
    pub fn new(client: reqwest::Client, base_url: String, timeout: Duration) -> Self {
        Self {
            client,
            base_url,
            key_param: DEFAULT_KEY_PARAM.to_string(),
            timeout,
        }
    }

    /// Override the query parameter name used for the API key.
    pub fn with_key_param(mut self, key_param: impl Into<String>) -> Self {
        self.key_param = key_param.into();
        self
    }
}

impl ScrapeBackend for ScraperApiClient {
    fn id(&self) -> &str {
        "scraperapi"
    }

    fn scrape<'a>(
        &'a self,
        api_key: &'a str,
        url: &'a str,
        params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            debug!(url, params = params.len(), "scrape backend request");
            let response = self
                .client
                .get(&self.base_url)
                .query(&[(self.key_param.as_str(), api_key), ("url", url)])
                .query(params)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(UpstreamError::from_reqwest)?;
            read_body(response).await
        })
    }
}
