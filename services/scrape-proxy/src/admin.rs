//! Admin API for pool inspection and maintenance
//!
//! Runs on a separate listener (`server.admin_listen_addr`) and is never
//! exposed alongside `/fetch`.
//!
//! Endpoints:
//! - GET  /admin/credentials: ledger state per credential (never API keys)
//! - GET  /admin/pool: pool summary and queue depth
//! - POST /admin/flush: write every credential to the store now
//! - POST /admin/drain: redrive one queued request if possible

use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use chrono::Utc;
use token_pool::Dispatcher;
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    dispatcher: Arc<Dispatcher>,
}

impl AdminState {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/credentials", get(list_credentials))
        .route("/admin/pool", get(pool_status))
        .route("/admin/flush", post(flush_ledger))
        .route("/admin/drain", post(drain_queue))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// GET /admin/credentials: every credential with usage, ceiling, and
/// current eligibility.
async fn list_credentials(State(state): State<AdminState>) -> impl IntoResponse {
    let ledger = state.dispatcher.ledger();
    let now = Utc::now();
    let credentials: Vec<serde_json::Value> = ledger
        .states()
        .into_iter()
        .map(|credential| {
            serde_json::json!({
                "id": credential.id,
                "tier": credential.tier.label(),
                "used_calls": credential.used_calls,
                "quota_ceiling": ledger.quota_ceiling(credential.tier),
                "active_requests": credential.active_requests,
                "reset_day": credential.reset_day,
                "period": format!("{:04}-{:02}", credential.period_year, credential.period_month),
                "cooldown_until": credential.cooldown_until,
                "eligible": ledger.is_eligible(&credential.id, now),
            })
        })
        .collect();

    json_response(
        StatusCode::OK,
        serde_json::json!({ "credentials": credentials }),
    )
}

/// GET /admin/pool: counts by availability plus queue depth.
async fn pool_status(State(state): State<AdminState>) -> impl IntoResponse {
    let summary = state.dispatcher.summary(Utc::now());
    json_response(
        StatusCode::OK,
        serde_json::to_value(&summary).unwrap_or_default(),
    )
}

/// POST /admin/flush: immediate full ledger snapshot.
async fn flush_ledger(State(state): State<AdminState>) -> impl IntoResponse {
    match state.dispatcher.ledger().snapshot_all().await {
        Ok(count) => {
            info!(credentials = count, "ledger flushed via admin API");
            json_response(StatusCode::OK, serde_json::json!({ "flushed": count }))
        }
        Err(e) => {
            warn!(error = %e, "admin ledger flush failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// POST /admin/drain: one drain attempt.
async fn drain_queue(State(state): State<AdminState>) -> impl IntoResponse {
    let redriven = state.dispatcher.drain_one();
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "redriven": redriven,
            "pending": state.dispatcher.queue().len(),
        }),
    )
}
