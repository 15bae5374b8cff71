//! Outbound collaborators of the scrape proxy
//!
//! Three seams decouple the scheduling core from the HTTP calls it makes:
//! - `TargetFetcher` fetches the target URL with no credential at all
//! - `ScrapeBackend` fetches through the credentialed scraping service
//! - `FallbackBackend` renders the page through the alternate backend
//!
//! Every failure is an `UpstreamError`, classified as `RateLimited` (HTTP 429,
//! the credential must cool down) or `Failure` (anything else).

pub mod direct;
pub mod fallback;
pub mod scraper;

pub use direct::DirectClient;
pub use fallback::BrowserlessClient;
pub use scraper::ScraperApiClient;

use bytes::Bytes;
use std::future::Future;
use std::pin::Pin;

/// Maximum number of characters of an upstream error body kept in an error.
const MAX_ERROR_BODY_CHARS: usize = 512;

/// Boxed future returned by the collaborator traits (keeps them dyn-compatible).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Classification of an outbound failure, driving the credential's fate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClassification {
    /// HTTP 429: cool the credential down and abandon it for this request
    RateLimited,
    /// Any other failure: escalate to the next tier
    Failure,
}

/// Errors from an outbound call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("upstream timed out: {0}")]
    Timeout(String),

    #[error("upstream request failed: {0}")]
    Transport(String),
}

impl UpstreamError {
    /// HTTP status of the failing call, if the upstream produced one.
    pub fn status(&self) -> Option<u16> {
        match self {
            UpstreamError::Status { status, .. } => Some(*status),
            UpstreamError::Timeout(_) | UpstreamError::Transport(_) => None,
        }
    }

    pub fn classify(&self) -> ErrorClassification {
        match self {
            UpstreamError::Status { status, .. } => classify_status(*status),
            UpstreamError::Timeout(_) | UpstreamError::Transport(_) => {
                ErrorClassification::Failure
            }
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        self.classify() == ErrorClassification::RateLimited
    }

    /// Convert a reqwest error, dropping the URL so query-string secrets
    /// (API keys, fallback tokens) never reach logs or responses.
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        let error = error.without_url();
        if error.is_timeout() {
            UpstreamError::Timeout(error.to_string())
        } else if let Some(status) = error.status() {
            UpstreamError::Status {
                status: status.as_u16(),
                body: error.to_string(),
            }
        } else {
            UpstreamError::Transport(error.to_string())
        }
    }
}

/// Result alias for outbound calls.
pub type Result<T> = std::result::Result<T, UpstreamError>;

/// Classify an upstream HTTP status. Only 429 is special.
pub fn classify_status(status: u16) -> ErrorClassification {
    match status {
        429 => ErrorClassification::RateLimited,
        _ => ErrorClassification::Failure,
    }
}

/// Fetch a target URL directly, with no credential.
pub trait TargetFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>>;
}

/// Fetch a target URL through the credentialed scraping service.
///
/// `params` are the extra query parameters of the current ladder tier.
pub trait ScrapeBackend: Send + Sync {
    /// Identifier for logging (e.g. "scraperapi")
    fn id(&self) -> &str;

    fn scrape<'a>(
        &'a self,
        api_key: &'a str,
        url: &'a str,
        params: &'a [(String, String)],
    ) -> BoxFuture<'a, Result<Bytes>>;
}

/// Render a target URL through the alternate backend used when no credential
/// pool is configured.
pub trait FallbackBackend: Send + Sync {
    /// Identifier for logging (e.g. "browserless")
    fn id(&self) -> &str;

    fn render<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Bytes>>;
}

/// Read a response body on success, or turn a non-2xx response into
/// `UpstreamError::Status` with a truncated copy of the body.
pub(crate) async fn read_body(response: reqwest::Response) -> Result<Bytes> {
    let status = response.status();
    if status.is_success() {
        return response.bytes().await.map_err(UpstreamError::from_reqwest);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| String::from("<no body>"));
    Err(UpstreamError::Status {
        status: status.as_u16(),
        body: truncate(&body),
    })
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY_CHARS {
        return body.to_string();
    }
    let mut short: String = body.chars().take(MAX_ERROR_BODY_CHARS).collect();
    short.push('…');
    short
}
