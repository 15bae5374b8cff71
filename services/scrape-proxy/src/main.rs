//! Scrape Proxy
//!
//! Single-binary Rust service that:
//! 1. Accepts `GET /fetch?url=<target>` requests
//! 2. Tries the target directly, then through a pool of scraping API
//!    credentials with per-credential quota and concurrency accounting
//! 3. Falls back to a headless rendering backend when no credentials exist
//! 4. Queues requests the pool cannot serve yet and redrives them as
//!    capacity returns

mod admin;
mod config;
mod error;
mod fetch;
mod metrics;
mod service;
mod store;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use metrics_exporter_prometheus::PrometheusHandle;
use token_pool::{Dispatcher, Ladder, Ledger, PendingQueue, PoolStatus, spawn_maintenance};
use upstream::{BrowserlessClient, DirectClient, FallbackBackend, ScraperApiClient};

use crate::config::Config;
use crate::fetch::{FetchParams, FetchState};
use crate::service::{ServiceAction, ServiceEvent, ServiceMetrics, ServiceState, handle_event};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    fetch: FetchState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the axum router with all routes and shared state.
///
/// `max_connections` bounds concurrently served requests; excess requests
/// wait in the limit layer.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/fetch", get(fetch_handler))
        .route("/healthz", get(health_handler))
        .route("/readyz", get(ready_handler))
        .route("/metrics", get(metrics_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting scrape-proxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle = metrics::install_recorder();

    // --- State: Initializing ---
    let mut state = ServiceState::Initializing;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        scraper_url = %config.scraper.base_url,
        credentials = config.credentials.len(),
        fallback = config.fallback.is_some(),
        store = ?config.store.backend,
        "configuration loaded"
    );

    // Transition: Initializing -> ConnectingStore
    let (new_state, action) = handle_event(
        state,
        ServiceEvent::ConfigLoaded {
            listen_addr: config.server.listen_addr,
            max_retries: config.store.connect_retries,
        },
    );
    state = new_state;
    info!(?action, "state: ConnectingStore");

    match action {
        ServiceAction::ConnectStore => {}
        _ => anyhow::bail!("unexpected action after ConfigLoaded: {action:?}"),
    };

    let kv = loop {
        match store::open_store(&config.store).await {
            Ok(kv) => break kv,
            Err(crate::error::Error::StoreConfig(msg)) => {
                // Bad URL or unreadable ledger file: retrying cannot help
                let _ = handle_event(state, ServiceEvent::StoreError(msg.clone()));
                anyhow::bail!("ledger store misconfigured: {msg}");
            }
            Err(crate::error::Error::StoreConnect(msg)) => {
                let (new_state, action) = handle_event(state, ServiceEvent::StoreError(msg.clone()));
                state = new_state;

                match action {
                    ServiceAction::ScheduleRetry { delay } => {
                        warn!(
                            error = %msg,
                            retry_in_secs = delay.as_secs(),
                            "ledger store unreachable, retrying"
                        );
                        tokio::time::sleep(delay).await;

                        // RetryTimer transitions Error -> ConnectingStore
                        let (new_state, _) = handle_event(state, ServiceEvent::RetryTimer);
                        state = new_state;
                    }
                    ServiceAction::Shutdown { exit_code } => {
                        error!(error = %msg, "ledger store unreachable after max retries");
                        std::process::exit(exit_code);
                    }
                    _ => anyhow::bail!("ledger store connection failed: {msg}"),
                }
            }
        }
    };

    // Transition: ConnectingStore -> Starting
    let (new_state, action) = handle_event(state, ServiceEvent::StoreConnected);
    state = new_state;
    info!(?action, store = kv.id(), "state: Starting");

    let listen_addr = match action {
        ServiceAction::StartListener { addr } => addr,
        _ => anyhow::bail!("unexpected action after StoreConnected: {action:?}"),
    };

    let ledger = Ledger::load(
        &config.credential_configs(),
        config.quota_policy(),
        kv,
        &config.store.key_prefix,
    )
    .await
    .context("failed to load credential ledger")?;
    let ledger = Arc::new(ledger);

    let client = reqwest::Client::new();
    let timeout = config.timeout();

    let mut scraper = ScraperApiClient::new(client.clone(), config.scraper.base_url.clone(), timeout);
    if let Some(key_param) = &config.scraper.key_param {
        scraper = scraper.with_key_param(key_param.clone());
    }

    let fallback: Option<Arc<dyn FallbackBackend>> = match &config.fallback {
        Some(fb) => {
            let token = fb
                .token
                .clone()
                .context("fallback token was not resolved")?;
            Some(Arc::new(BrowserlessClient::new(
                client.clone(),
                fb.endpoint.clone(),
                token,
                fb.launch.clone(),
                &fb.wait_until,
                timeout,
            )))
        }
        None => None,
    };

    let ladder = Ladder::new(config.ladder_tiers()).context("invalid escalation ladder")?;

    let dispatcher = Arc::new(Dispatcher::new(
        ledger.clone(),
        token_pool::CredentialPool::from_configs(&config.credential_configs()),
        ladder,
        Arc::new(DirectClient::new(client.clone(), timeout)),
        Arc::new(scraper),
        fallback,
        PendingQueue::new(config.pool.max_pending),
    ));

    let maintenance = spawn_maintenance(dispatcher.clone(), config.maintenance_intervals());

    let admin_server = match config.server.admin_listen_addr {
        Some(admin_addr) => {
            let admin_app =
                admin::build_admin_router(admin::AdminState::new(dispatcher.clone()));
            let admin_listener = TcpListener::bind(admin_addr)
                .await
                .with_context(|| format!("failed to bind admin listener to {admin_addr}"))?;
            info!(addr = %admin_addr, "admin API listening");
            Some(tokio::spawn(async move {
                if let Err(e) = axum::serve(admin_listener, admin_app).await {
                    error!(error = %e, "admin server error");
                }
            }))
        }
        None => None,
    };

    let metrics = ServiceMetrics::new();

    let app_state = AppState {
        fetch: FetchState {
            dispatcher: dispatcher.clone(),
            requests_total: metrics.requests_total.clone(),
            errors_total: metrics.errors_total.clone(),
            in_flight: metrics.in_flight.clone(),
        },
        metrics: metrics.clone(),
        prometheus: prometheus_handle,
    };

    let app = build_router(app_state, config.server.max_connections);

    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;

    // Transition: Starting -> Running
    let (new_state, _) = handle_event(state, ServiceEvent::ListenerReady);
    state = new_state;
    info!(addr = %listen_addr, "state: Running, accepting requests");

    let in_flight = metrics.in_flight.clone();

    // The drain deadline starts when the signal fires, not when the server
    // starts: notify the server to drain, then race it against the deadline.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // Transition: Running -> Draining
    let (new_state, action) = handle_event(state, ServiceEvent::ShutdownSignal);
    state = new_state;
    let deadline = match action {
        ServiceAction::BeginDrain { deadline } => deadline,
        _ => std::time::Instant::now(),
    };

    let _ = shutdown_tx.send(());

    let drain_event = match tokio::time::timeout_at(deadline.into(), server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("all in-flight requests drained");
            ServiceEvent::DrainComplete
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
            ServiceEvent::DrainComplete
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
            ServiceEvent::DrainComplete
        }
        Err(_) => {
            let remaining = in_flight.load(Ordering::Relaxed);
            warn!(
                remaining,
                pending = dispatcher.queue().len(),
                drain_timeout_secs = service::DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
            ServiceEvent::DrainTimeout
        }
    };

    // Transition: Draining -> Stopped
    let (_state, action) = handle_event(state, drain_event);
    info!(?action, "state: Stopped");

    maintenance.abort();
    if let Some(admin) = admin_server {
        admin.abort();
    }

    // Final snapshot so quota usage survives the restart
    match ledger.snapshot_all().await {
        Ok(count) => info!(credentials = count, "ledger flushed"),
        Err(e) => error!(error = %e, "final ledger flush failed"),
    }

    info!("shutdown complete");
    Ok(())
}

/// Liveness: the process is up and serving. Always 200.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let body = serde_json::json!({
        "status": "ok",
        "uptime_seconds": state.metrics.started_at.elapsed().as_secs(),
        "requests_served": state.metrics.requests_total.load(Ordering::Relaxed),
        "errors_total": state.metrics.errors_total.load(Ordering::Relaxed),
    });

    (
        axum::http::StatusCode::OK,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Readiness: 200 while something can serve a request (an eligible
/// credential or the fallback backend), 503 otherwise.
async fn ready_handler(State(state): State<AppState>) -> impl IntoResponse {
    let summary = state.fetch.dispatcher.summary(Utc::now());
    let status_code = if summary.is_ready() {
        axum::http::StatusCode::OK
    } else {
        axum::http::StatusCode::SERVICE_UNAVAILABLE
    };
    let status = match summary.status {
        PoolStatus::Healthy => "healthy",
        PoolStatus::Degraded => "degraded",
        PoolStatus::Unhealthy => "unhealthy",
    };

    let body = serde_json::json!({
        "status": status,
        "credentials": summary.credentials,
        "eligible": summary.eligible,
        "pending": summary.pending,
        "fallback_configured": summary.fallback_configured,
    });

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint: text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        axum::http::StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn fetch_handler(
    State(state): State<AppState>,
    Query(params): Query<FetchParams>,
) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    fetch::fetch(&state.fetch, params, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use bytes::Bytes;
    use kv_store::MemoryStore;
    use std::time::Duration;
    use token_pool::{CredentialPool, DEFAULT_KEY_PREFIX, QuotaPolicy};
    use tower::ServiceExt;
    use upstream::{BoxFuture, UpstreamError};

    /// Create a PrometheusHandle for tests without installing a global recorder.
    fn test_prometheus_handle() -> PrometheusHandle {
        let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
        recorder.handle()
    }

    /// Fallback that always answers with a fixed result.
    struct StaticFallback(upstream::Result<Bytes>);

    impl FallbackBackend for StaticFallback {
        fn id(&self) -> &str {
            "static"
        }

        fn render<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, upstream::Result<Bytes>> {
            let result = self.0.clone();
            Box::pin(async move { result })
        }
    }

    /// App state with no credentials, a real direct client, and an optional
    /// fallback.
    async fn test_app_state(fallback: Option<Arc<dyn FallbackBackend>>) -> AppState {
        let ledger = Ledger::load(
            &[],
            QuotaPolicy::default(),
            Arc::new(MemoryStore::new()),
            DEFAULT_KEY_PREFIX,
        )
        .await
        .unwrap();
        let client = reqwest::Client::new();
        let timeout = Duration::from_secs(5);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(ledger),
            CredentialPool::default(),
            Ladder::default(),
            Arc::new(DirectClient::new(client.clone(), timeout)),
            Arc::new(ScraperApiClient::new(
                client,
                "http://127.0.0.1:1".into(),
                timeout,
            )),
            fallback,
            PendingQueue::new(None),
        ));

        let metrics = ServiceMetrics::new();
        AppState {
            fetch: FetchState {
                dispatcher,
                requests_total: metrics.requests_total.clone(),
                errors_total: metrics.errors_total.clone(),
                in_flight: metrics.in_flight.clone(),
            },
            metrics,
            prometheus: test_prometheus_handle(),
        }
    }

    /// Mock target site: `/ok` serves a page, everything else is 403.
    async fn start_target_server() -> (String, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{addr}");

        let handle = tokio::spawn(async move {
            let app = axum::Router::new()
                .route("/ok", get(|| async { "<html>target page</html>" }))
                .fallback(|| async { (StatusCode::FORBIDDEN, "blocked") });
            axum::serve(listener, app).await.unwrap();
        });

        (url, handle)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn healthz_returns_json() {
        let state = test_app_state(None).await;
        state.metrics.requests_total.fetch_add(5, Ordering::Relaxed);

        let app = build_router(state, 1000);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/healthz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "ok");
        assert_eq!(json["requests_served"], 5);
        assert!(json["uptime_seconds"].is_u64());
    }

    #[tokio::test]
    async fn readyz_unavailable_with_nothing_to_serve() {
        let state = test_app_state(None).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/readyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let json = body_json(response).await;
        assert_eq!(json["status"], "unhealthy");
        assert_eq!(json["credentials"], 0);
    }

    #[tokio::test]
    async fn readyz_ok_with_fallback() {
        let fallback: Arc<dyn FallbackBackend> =
            Arc::new(StaticFallback(Ok(Bytes::from_static(b"rendered"))));
        let state = test_app_state(Some(fallback)).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/readyz")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["fallback_configured"], true);
    }

    #[tokio::test]
    async fn fetch_without_url_is_400() {
        let state = test_app_state(None).await;
        let errors_total = state.metrics.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(Request::builder().uri("/fetch").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(response.headers().get("x-request-id").is_some());
        let json = body_json(response).await;
        assert_eq!(json["error"], "invalid_request");
        let request_id = json["request_id"].as_str().unwrap();
        assert!(
            request_id.starts_with("req_"),
            "request_id must start with 'req_', got: {request_id}"
        );
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn fetch_returns_direct_body() {
        let (target, _server) = start_target_server().await;
        let state = test_app_state(None).await;
        let requests_total = state.metrics.requests_total.clone();
        let in_flight = state.metrics.in_flight.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/fetch?url={target}/ok"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-fetch-route").unwrap(), "direct");
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"<html>target page</html>");
        assert_eq!(requests_total.load(Ordering::Relaxed), 1);
        assert_eq!(in_flight.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn blocked_target_goes_to_fallback() {
        let (target, _server) = start_target_server().await;
        let fallback: Arc<dyn FallbackBackend> =
            Arc::new(StaticFallback(Ok(Bytes::from_static(b"rendered page"))));
        let state = test_app_state(Some(fallback)).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/fetch?url={target}/blocked"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-fetch-route").unwrap(), "fallback");
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        assert_eq!(&body[..], b"rendered page");
    }

    #[tokio::test]
    async fn fallback_failure_status_is_mirrored() {
        let (target, _server) = start_target_server().await;
        let fallback: Arc<dyn FallbackBackend> =
            Arc::new(StaticFallback(Err(UpstreamError::Status {
                status: 504,
                body: "render timed out".into(),
            })));
        let state = test_app_state(Some(fallback)).await;
        let errors_total = state.metrics.errors_total.clone();
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/fetch?url={target}/blocked"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
        let json = body_json(response).await;
        assert_eq!(json["error"], "fetch_failed");
        assert_eq!(errors_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn no_credentials_and_no_fallback_is_500() {
        let (target, _server) = start_target_server().await;
        let state = test_app_state(None).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri(format!("/fetch?url={target}/blocked"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = body_json(response).await;
        assert_eq!(json["error"], "pool_empty");
    }

    #[tokio::test]
    async fn metrics_endpoint_returns_prometheus_format() {
        let state = test_app_state(None).await;
        let app = build_router(state, 1000);

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
