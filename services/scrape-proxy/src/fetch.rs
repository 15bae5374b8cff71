//! Fetch endpoint
//!
//! `GET /fetch?url=<target>` hands the target to the dispatcher and returns
//! the fetched body verbatim. Failures become a JSON error payload with the
//! status of the failing outbound call where there is one.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use token_pool::{Dispatcher, Error as PoolError};
use tracing::{error, info, instrument, warn};

/// Shared state passed to the fetch handler via axum State extractor
#[derive(Clone)]
pub struct FetchState {
    pub dispatcher: Arc<Dispatcher>,
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    pub in_flight: Arc<AtomicU64>,
}

#[derive(Debug, Deserialize)]
pub struct FetchParams {
    pub url: Option<String>,
}

/// Decrements the in-flight counter when the request finishes or is dropped.
struct InFlight(Arc<AtomicU64>);

impl InFlight {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

/// JSON error response: `{"error": ..., "details": ..., "request_id": ...}`
fn error_response(status: StatusCode, error: &str, details: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": error,
        "details": details,
        "request_id": request_id,
    });
    (
        status,
        [
            (axum::http::header::CONTENT_TYPE, "application/json"),
            (
                axum::http::header::HeaderName::from_static("x-request-id"),
                request_id,
            ),
        ],
        body.to_string(),
    )
        .into_response()
}

/// Status for a terminal dispatch failure: the outbound call's status when
/// it is an error status, otherwise 500.
fn status_for(err: &PoolError) -> StatusCode {
    err.status()
        .and_then(|status| StatusCode::from_u16(status).ok())
        .filter(|status| status.is_client_error() || status.is_server_error())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn error_kind(err: &PoolError) -> &'static str {
    match err {
        PoolError::QueueFull(_) => "queue_full",
        PoolError::PoolEmpty => "pool_empty",
        PoolError::Outbound(_) => "fetch_failed",
        _ => "internal_error",
    }
}

#[instrument(skip_all, fields(request_id = %request_id))]
pub async fn fetch(state: &FetchState, params: FetchParams, request_id: String) -> Response {
    state.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlight::enter(&state.in_flight);
    let started = Instant::now();

    let Some(url) = params.url.filter(|u| !u.trim().is_empty()) else {
        state.errors_total.fetch_add(1, Ordering::Relaxed);
        warn!("fetch request without url");
        crate::metrics::record_fetch("invalid", started.elapsed().as_secs_f64());
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request",
            "missing required query parameter: url",
            &request_id,
        );
    };

    match state.dispatcher.fetch(url.clone(), request_id.clone()).await {
        Ok(fetched) => {
            let outcome = fetched.route.label();
            info!(
                url = %url,
                route = outcome,
                bytes = fetched.body.len(),
                duration_ms = started.elapsed().as_millis() as u64,
                "fetch complete"
            );
            crate::metrics::record_fetch(outcome, started.elapsed().as_secs_f64());
            let mut response = (StatusCode::OK, fetched.body).into_response();
            let headers = response.headers_mut();
            headers.insert("x-fetch-route", HeaderValue::from_static(outcome));
            if let Ok(value) = HeaderValue::from_str(&request_id) {
                headers.insert("x-request-id", value);
            }
            response
        }
        Err(e) => {
            state.errors_total.fetch_add(1, Ordering::Relaxed);
            let status = status_for(&e);
            error!(url = %url, status = status.as_u16(), error = %e, "fetch failed");
            crate::metrics::record_fetch("error", started.elapsed().as_secs_f64());
            error_response(status, error_kind(&e), &e.to_string(), &request_id)
        }
    }
}
