//! Fallback rendering backend (Browserless `/content`-style API).
//!
//! `POST <endpoint>?token=<token>&launch=<launch options>` with a JSON body
//! `{"url": ..., "gotoOptions": {...}}`. Used only when no scraping
//! credentials are configured.

use bytes::Bytes;
use common::Secret;
use std::time::Duration;
use tracing::debug;

use crate::{BoxFuture, FallbackBackend, Result, UpstreamError, read_body};

pub struct BrowserlessClient {
    client: reqwest::Client,
    endpoint: String,
    token: Secret<String>,
    /// JSON launch options, passed through as the `launch` query parameter
    launch: Option<String>,
    goto_options: serde_json::Value,
    timeout: Duration,
}

impl BrowserlessClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: String,
        token: Secret<String>,
        launch: Option<String>,
        wait_until: &str,
        timeout: Duration,
    ) -> Self {
        let goto_options = serde_json::json!({
            "waitUntil": wait_until,
            "timeout": timeout.as_millis() as u64,
        });
        Self {
            client,
            endpoint,
            token,
            launch,
            goto_options,
            timeout,
        }
    }
}

impl FallbackBackend for BrowserlessClient {
    fn id(&self) -> &str {
        "browserless"
    }

    fn render<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>> {
        Box::pin(async move {
            debug!(url, "fallback render");
            let mut query: Vec<(&str, &str)> = vec![("token", self.token.expose().as_str())];
            if let Some(launch) = &self.launch {
                query.push(("launch", launch.as_str()));
            }
            let response = self
                .client
                .post(&self.endpoint)
                .query(&query)
                .json(&serde_json::json!({
                    "url": url,
                    "gotoOptions": self.goto_options,
                }))
                .timeout(self.timeout)
                .send()
                .await
                .map_err(UpstreamError::from_reqwest)?;
            read_body(response).await
        })
    }
}
