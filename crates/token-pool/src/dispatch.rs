//! Per-request dispatch
//!
//! Every inbound fetch runs in its own spawned task, so a caller that hangs up
//! mid-ladder never leaves an in-flight slot charged. The task tries the target
//! directly, then loops over credentials until one succeeds, the request is
//! queued, or a terminal failure is reached:
//!
//! ```text
//! DIRECT ─fail─▶ SELECT ─id─▶ LADDER ─ok─▶ SUCCESS
//!                  │  ▲          │
//!                  │  └─reject───┘   (credential marked tried)
//!                  ├─pool empty─▶ FALLBACK ─▶ SUCCESS | FAILED
//!                  └─none left──▶ QUEUED | FAILED
//! ```
//!
//! SELECT only re-runs after a credential joins the tried set, so the loop
//! ends once every credential has been excluded.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};
use upstream::{FallbackBackend, ScrapeBackend, TargetFetcher, UpstreamError};

use crate::error::{Error, Result};
use crate::ladder::Ladder;
use crate::ledger::Ledger;
use crate::pool::CredentialPool;
use crate::queue::{PendingQueue, PendingRequest};
use crate::selector::select_eligible;

/// How a response was obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Direct,
    Credential(String),
    Fallback,
}

impl Route {
    pub fn label(&self) -> &'static str {
        match self {
            Route::Direct => "direct",
            Route::Credential(_) => "credential",
            Route::Fallback => "fallback",
        }
    }
}

/// A successfully fetched body.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub body: Bytes,
    pub route: Route,
}

enum Step {
    Select,
    Ladder(String),
    Fallback,
}

enum Outcome {
    Done(Result<Fetched>),
    Queue,
}

/// Overall pool condition for readiness reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolStatus {
    /// Every credential is selectable, or the fallback serves an empty pool
    Healthy,
    /// Some requests can still be served
    Degraded,
    /// Nothing can serve a request right now
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolSummary {
    pub status: PoolStatus,
    pub credentials: usize,
    pub eligible: usize,
    pub cooling_down: usize,
    pub exhausted: usize,
    pub busy: usize,
    pub pending: usize,
    pub max_pending: Option<usize>,
    pub fallback_configured: bool,
}

impl PoolSummary {
    pub fn is_ready(&self) -> bool {
        self.status != PoolStatus::Unhealthy
    }
}

pub struct Dispatcher {
    ledger: Arc<Ledger>,
    pool: CredentialPool,
    ladder: Ladder,
    direct: Arc<dyn TargetFetcher>,
    scraper: Arc<dyn ScrapeBackend>,
    fallback: Option<Arc<dyn FallbackBackend>>,
    queue: PendingQueue,
}

impl Dispatcher {
    pub fn new(
        ledger: Arc<Ledger>,
        pool: CredentialPool,
        ladder: Ladder,
        direct: Arc<dyn TargetFetcher>,
        scraper: Arc<dyn ScrapeBackend>,
        fallback: Option<Arc<dyn FallbackBackend>>,
        queue: PendingQueue,
    ) -> Self {
        Self {
            ledger,
            pool,
            ladder,
            direct,
            scraper,
            fallback,
            queue,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Serve one inbound fetch.
    ///
    /// Resolves once a response exists; a queued request stays pending until
    /// a drain redrives it.
    pub async fn fetch(self: &Arc<Self>, url: String, request_id: String) -> Result<Fetched> {
        let (pending, receiver) = PendingRequest::new(url, request_id);
        let this = Arc::clone(self);
        tokio::spawn(async move { this.dispatch(pending).await });
        receiver.await.unwrap_or(Err(Error::Abandoned))
    }

    async fn dispatch(self: Arc<Self>, pending: PendingRequest) {
        match self.direct.fetch(&pending.url).await {
            Ok(body) => {
                debug!(request_id = %pending.request_id, "direct fetch succeeded");
                self.complete(
                    pending,
                    Ok(Fetched {
                        body,
                        route: Route::Direct,
                    }),
                );
                return;
            }
            Err(e) => {
                debug!(request_id = %pending.request_id, error = %e, "direct fetch failed, selecting credential");
            }
        }

        match self.resolve(&pending, Step::Select).await {
            Outcome::Done(result) => self.complete(pending, result),
            Outcome::Queue => {
                let request_id = pending.request_id.clone();
                match self.queue.enqueue(pending) {
                    Ok(depth) => info!(%request_id, depth, "no credential available, request queued"),
                    Err(rejected) => {
                        let depth = self.queue.len();
                        warn!(%request_id, depth, "pending queue full, rejecting request");
                        rejected.respond(Err(Error::QueueFull(depth)));
                    }
                }
            }
        }
    }

    /// Walk the state machine from `step` until a terminal outcome.
    ///
    /// Running out of credentials is a terminal failure only when every
    /// configured credential's ladder ended in an outbound failure. If any
    /// credential was skipped as busy, spent, or cooling down, the request
    /// waits in the queue for it instead.
    async fn resolve(&self, pending: &PendingRequest, first: Step) -> Outcome {
        let url = pending.url.as_str();
        let request_id = pending.request_id.as_str();
        let mut tried: HashSet<String> = HashSet::new();
        // Credentials whose whole ladder ended in an outbound failure
        let mut failed: HashSet<String> = HashSet::new();
        let mut last_failure: Option<UpstreamError> = None;
        let mut step = first;

        loop {
            step = match step {
                Step::Select => {
                    if self.pool.is_empty() {
                        Step::Fallback
                    } else {
                        match self.select(&tried) {
                            Ok(id) => Step::Ladder(id),
                            Err(e) => {
                                return match last_failure {
                                    Some(failure) if self.covers_pool(&failed) => {
                                        error!(request_id, error = %failure, "every credential failed");
                                        Outcome::Done(Err(Error::Outbound(failure)))
                                    }
                                    _ => {
                                        debug!(request_id, tried = tried.len(), reason = %e, "waiting for a credential");
                                        Outcome::Queue
                                    }
                                };
                            }
                        }
                    }
                }
                Step::Ladder(id) => {
                    let result = match self.pool.api_key(&id) {
                        Some(api_key) => {
                            self.ladder
                                .run(&self.ledger, self.scraper.as_ref(), &id, api_key.expose(), url)
                                .await
                        }
                        None => Err(Error::UnknownCredential(id.clone())),
                    };
                    match result {
                        Ok(body) => {
                            info!(request_id, credential_id = %id, "fetched via credential");
                            return Outcome::Done(Ok(Fetched {
                                body,
                                route: Route::Credential(id),
                            }));
                        }
                        Err(Error::Outbound(e)) => {
                            warn!(request_id, credential_id = %id, error = %e, "ladder exhausted");
                            failed.insert(id.clone());
                            last_failure = Some(e);
                        }
                        Err(e) => {
                            debug!(request_id, credential_id = %id, error = %e, "credential rejected, reselecting");
                        }
                    }
                    tried.insert(id);
                    Step::Select
                }
                Step::Fallback => return Outcome::Done(self.fallback(url, request_id).await),
            };
        }
    }

    fn select(&self, tried: &HashSet<String>) -> Result<String> {
        select_eligible(&self.ledger, &self.pool, tried, Utc::now())
            .ok_or(Error::NoCredentialAvailable)
    }

    /// Every configured credential is in `ids`.
    fn covers_pool(&self, ids: &HashSet<String>) -> bool {
        self.pool
            .premium()
            .iter()
            .chain(self.pool.free())
            .all(|id| ids.contains(id))
    }

    async fn fallback(&self, url: &str, request_id: &str) -> Result<Fetched> {
        let Some(fallback) = self.fallback.as_ref() else {
            error!(request_id, "no credentials configured and no fallback backend");
            return Err(Error::PoolEmpty);
        };
        match fallback.render(url).await {
            Ok(body) => {
                info!(request_id, backend = fallback.id(), "fetched via fallback");
                Ok(Fetched {
                    body,
                    route: Route::Fallback,
                })
            }
            Err(e) => {
                error!(request_id, backend = fallback.id(), error = %e, "fallback failed");
                Err(Error::Outbound(e))
            }
        }
    }

    fn complete(self: &Arc<Self>, pending: PendingRequest, result: Result<Fetched>) {
        let succeeded = result.is_ok();
        pending.respond(result);
        if succeeded && !self.queue.is_empty() {
            self.drain_one();
        }
    }

    /// Redrive the oldest queued request if something can serve it.
    ///
    /// Never waits on the redriven request. Returns whether one was dequeued.
    pub fn drain_one(self: &Arc<Self>) -> bool {
        if self.queue.is_empty() {
            return false;
        }
        let step = if self.pool.is_empty() {
            Step::Fallback
        } else {
            match self.select(&HashSet::new()) {
                Ok(id) => Step::Ladder(id),
                Err(e) => {
                    debug!(pending = self.queue.len(), reason = %e, "nothing to drain with");
                    return false;
                }
            }
        };
        let Some(pending) = self.queue.pop_front() else {
            return false;
        };

        debug!(request_id = %pending.request_id, "redriving queued request");
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match this.resolve(&pending, step).await {
                Outcome::Done(result) => this.complete(pending, result),
                Outcome::Queue => {
                    debug!(request_id = %pending.request_id, "still no credential, back in line");
                    this.queue.requeue(pending);
                }
            }
        });
        true
    }

    /// Count credentials by availability at `now`.
    pub fn summary(&self, now: DateTime<Utc>) -> PoolSummary {
        let policy = self.ledger.policy();
        let states = self.ledger.states();
        let (mut eligible, mut cooling_down, mut exhausted, mut busy) = (0, 0, 0, 0);
        for state in &states {
            if state.in_cooldown(now) {
                cooling_down += 1;
            } else if state.used_calls >= policy.quota_ceiling(state.tier) {
                exhausted += 1;
            } else if state.active_requests >= policy.max_concurrency {
                busy += 1;
            } else {
                eligible += 1;
            }
        }

        let fallback_configured = self.fallback.is_some();
        let status = if states.is_empty() {
            if fallback_configured {
                PoolStatus::Healthy
            } else {
                PoolStatus::Unhealthy
            }
        } else if eligible + busy == states.len() {
            PoolStatus::Healthy
        } else if eligible > 0 || fallback_configured {
            PoolStatus::Degraded
        } else {
            PoolStatus::Unhealthy
        };

        PoolSummary {
            status,
            credentials: states.len(),
            eligible,
            cooling_down,
            exhausted,
            busy,
            pending: self.queue.len(),
            max_pending: self.queue.max_pending(),
            fallback_configured,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::{CredentialConfig, Tier};
    use crate::ladder::tests::{ScriptedBackend, status_error};
    use crate::ledger::QuotaPolicy;
    use crate::ledger::tests::{config, test_ledger};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use upstream::BoxFuture;

    struct FailingDirect;

    impl TargetFetcher for FailingDirect {
        fn fetch<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, upstream::Result<Bytes>> {
            Box::pin(async { Err(status_error(403)) })
        }
    }

    struct SucceedingDirect;

    impl TargetFetcher for SucceedingDirect {
        fn fetch<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, upstream::Result<Bytes>> {
            Box::pin(async { Ok(Bytes::from_static(b"direct")) })
        }
    }

    struct CountingFallback {
        calls: AtomicUsize,
        result: upstream::Result<Bytes>,
    }

    impl CountingFallback {
        fn new(result: upstream::Result<Bytes>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                result,
            }
        }
    }

    impl FallbackBackend for CountingFallback {
        fn id(&self) -> &str {
            "counting"
        }

        fn render<'a>(&'a self, _url: &'a str) -> BoxFuture<'a, upstream::Result<Bytes>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.result.clone()
            })
        }
    }

    /// Backend whose calls block until released, to hold slots open.
    struct GatedBackend {
        gate: tokio::sync::Semaphore,
        calls: Mutex<Vec<String>>,
    }

    impl GatedBackend {
        fn new() -> Self {
            Self {
                gate: tokio::sync::Semaphore::new(0),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    impl ScrapeBackend for GatedBackend {
        fn id(&self) -> &str {
            "gated"
        }

        fn scrape<'a>(
            &'a self,
            api_key: &'a str,
            _url: &'a str,
            _params: &'a [(String, String)],
        ) -> BoxFuture<'a, upstream::Result<Bytes>> {
            Box::pin(async move {
                self.calls.lock().unwrap().push(api_key.to_string());
                let permit = self.gate.acquire().await;
                drop(permit);
                Ok(Bytes::from_static(b"gated"))
            })
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        ledger: Arc<Ledger>,
    }

    async fn harness(
        configs: &[CredentialConfig],
        policy: QuotaPolicy,
        direct: Arc<dyn TargetFetcher>,
        scraper: Arc<dyn ScrapeBackend>,
        fallback: Option<Arc<dyn FallbackBackend>>,
        max_pending: Option<usize>,
    ) -> Harness {
        let (ledger, _) = test_ledger(configs, policy).await;
        let dispatcher = Arc::new(Dispatcher::new(
            ledger.clone(),
            CredentialPool::from_configs(configs),
            Ladder::default(),
            direct,
            scraper,
            fallback,
            PendingQueue::new(max_pending),
        ));
        Harness { dispatcher, ledger }
    }

    async fn wait_for_queue(dispatcher: &Dispatcher, depth: usize) {
        for _ in 0..200 {
            if dispatcher.queue().len() == depth {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue never reached depth {depth}");
    }

    fn fetch_url(dispatcher: &Arc<Dispatcher>, n: usize) -> tokio::task::JoinHandle<Result<Fetched>> {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move {
            dispatcher
                .fetch(format!("https://example.com/{n}"), format!("req_{n}"))
                .await
        })
    }

    #[tokio::test]
    async fn direct_success_skips_credentials() {
        let backend = Arc::new(ScriptedBackend::succeeding());
        let h = harness(
            &[config("a", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(SucceedingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        let fetched = h.dispatcher.fetch("https://example.com".into(), "req_1".into()).await.unwrap();
        assert_eq!(fetched.route, Route::Direct);
        assert_eq!(fetched.body, Bytes::from_static(b"direct"));
        assert!(backend.calls().is_empty());
        assert_eq!(h.ledger.state("a").unwrap().used_calls, 0);
    }

    #[tokio::test]
    async fn exhausted_premium_falls_through_to_free() {
        let policy = QuotaPolicy {
            premium_quota: 10,
            ..QuotaPolicy::default()
        };
        let backend = Arc::new(ScriptedBackend::succeeding());
        let h = harness(
            &[config("cred-a", Tier::Premium), config("cred-b", Tier::Free)],
            policy,
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        // Spend cred-a up to its ceiling
        h.ledger.try_acquire("cred-a", 10).await.unwrap();
        h.ledger.release("cred-a").await;

        let fetched = h.dispatcher.fetch("https://example.com".into(), "req_1".into()).await.unwrap();
        assert_eq!(fetched.route, Route::Credential("cred-b".into()));
        assert_eq!(h.ledger.state("cred-a").unwrap().used_calls, 10, "cred-a untouched");
        assert_eq!(h.ledger.state("cred-b").unwrap().used_calls, 1);
        assert_eq!(backend.calls_for("key_cred-a"), 0);
    }

    #[tokio::test]
    async fn rate_limited_credential_is_swapped_out() {
        let backend = Arc::new(
            ScriptedBackend::succeeding().script("key_p", vec![Err(status_error(429))]),
        );
        let h = harness(
            &[config("p", Tier::Premium), config("f", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;
        let before = Utc::now();

        let fetched = h.dispatcher.fetch("https://example.com".into(), "req_1".into()).await.unwrap();

        assert_eq!(fetched.route, Route::Credential("f".into()));
        assert_eq!(backend.calls_for("key_p"), 1, "ladder aborted after tier 1");
        let until = h.ledger.state("p").unwrap().cooldown_until.unwrap();
        assert!(until >= before + chrono::Duration::seconds(60));
    }

    #[tokio::test]
    async fn single_credential_ladder_exhaustion_is_terminal() {
        let backend = Arc::new(ScriptedBackend::failing(500).script(
            "key_only",
            vec![
                Err(status_error(500)),
                Err(status_error(500)),
                Err(status_error(500)),
                Err(status_error(502)),
            ],
        ));
        let h = harness(
            &[config("only", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        let err = h
            .dispatcher
            .fetch("https://example.com".into(), "req_1".into())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(502), "last tier's status mirrored");
        assert_eq!(backend.calls().len(), 4);
        assert_eq!(h.ledger.state("only").unwrap().used_calls, 17);
        assert!(h.dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn failed_ladder_waits_for_busy_credential() {
        let policy = QuotaPolicy {
            max_concurrency: 1,
            ..QuotaPolicy::default()
        };
        let backend = Arc::new(ScriptedBackend::succeeding().script(
            "key_a",
            (0..8).map(|_| Err(status_error(500))).collect(),
        ));
        let h = harness(
            &[config("a", Tier::Premium), config("b", Tier::Free)],
            policy,
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        // b's only slot is taken; a will fail every tier
        h.ledger.try_acquire("b", 1).await.unwrap();

        let waiting = fetch_url(&h.dispatcher, 1);
        wait_for_queue(&h.dispatcher, 1).await;
        assert!(!waiting.is_finished(), "untried busy credential means wait, not fail");
        assert_eq!(backend.calls_for("key_a"), 4);
        assert_eq!(backend.calls_for("key_b"), 0);

        h.ledger.release("b").await;
        assert!(h.dispatcher.drain_one());

        let fetched = tokio::time::timeout(Duration::from_secs(2), waiting)
            .await
            .expect("queued request redriven")
            .unwrap()
            .unwrap();
        assert_eq!(fetched.route, Route::Credential("b".into()));
        assert!(h.dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn every_ladder_failing_is_terminal() {
        let backend = Arc::new(ScriptedBackend::failing(500));
        let h = harness(
            &[config("a", Tier::Premium), config("b", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        let err = h
            .dispatcher
            .fetch("https://example.com".into(), "req_1".into())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(500));
        assert_eq!(backend.calls_for("key_a"), 4);
        assert_eq!(backend.calls_for("key_b"), 4);
        assert!(h.dispatcher.queue().is_empty());
    }

    #[tokio::test]
    async fn select_reports_no_credential_available() {
        let h = harness(
            &[config("a", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            None,
            None,
        )
        .await;

        assert_eq!(h.dispatcher.select(&HashSet::new()).unwrap(), "a");
        h.ledger.start_cooldown("a", Utc::now()).await.unwrap();
        assert!(matches!(
            h.dispatcher.select(&HashSet::new()),
            Err(Error::NoCredentialAvailable)
        ));
    }

    #[tokio::test]
    async fn empty_pool_uses_fallback_exactly_once() {
        let fallback = Arc::new(CountingFallback::new(Ok(Bytes::from_static(b"rendered"))));
        let h = harness(
            &[],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            Some(fallback.clone()),
            None,
        )
        .await;

        let fetched = h.dispatcher.fetch("https://example.com".into(), "req_1".into()).await.unwrap();
        assert_eq!(fetched.route, Route::Fallback);
        assert_eq!(fetched.body, Bytes::from_static(b"rendered"));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_failure_is_surfaced() {
        let fallback = Arc::new(CountingFallback::new(Err(status_error(504))));
        let h = harness(
            &[],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            Some(fallback.clone()),
            None,
        )
        .await;

        let err = h
            .dispatcher
            .fetch("https://example.com".into(), "req_1".into())
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(504));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_pool_without_fallback_fails() {
        let h = harness(
            &[],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            None,
            None,
        )
        .await;

        let err = h
            .dispatcher
            .fetch("https://example.com".into(), "req_1".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::PoolEmpty));
    }

    #[tokio::test]
    async fn fallback_is_not_used_for_an_exhausted_pool() {
        let fallback = Arc::new(CountingFallback::new(Ok(Bytes::from_static(b"rendered"))));
        let h = harness(
            &[config("a", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            Some(fallback.clone()),
            None,
        )
        .await;
        h.ledger.start_cooldown("a", Utc::now()).await.unwrap();

        let handle = fetch_url(&h.dispatcher, 1);
        wait_for_queue(&h.dispatcher, 1).await;

        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
        handle.abort();
    }

    #[tokio::test]
    async fn exhausted_pool_queues_then_redrives_on_release() {
        let policy = QuotaPolicy {
            max_concurrency: 1,
            ..QuotaPolicy::default()
        };
        let backend = Arc::new(GatedBackend::new());
        let h = harness(
            &[config("a", Tier::Free)],
            policy,
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        // First request holds the only slot
        let first = fetch_url(&h.dispatcher, 1);
        for _ in 0..200 {
            if h.ledger.state("a").unwrap().active_requests == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // Second request finds no credential and waits in the queue
        let second = fetch_url(&h.dispatcher, 2);
        wait_for_queue(&h.dispatcher, 1).await;
        assert!(!second.is_finished());

        // Completing the first triggers a drain that serves the second
        backend.gate.add_permits(2);
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.route, Route::Credential("a".into()));
        let second = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .expect("queued request redriven")
            .unwrap()
            .unwrap();
        assert_eq!(second.route, Route::Credential("a".into()));

        assert!(h.dispatcher.queue().is_empty());
        assert_eq!(backend.calls.lock().unwrap().len(), 2);
        assert_eq!(h.ledger.state("a").unwrap().active_requests, 0);
    }

    #[tokio::test]
    async fn drain_one_waits_for_an_eligible_credential() {
        let backend = Arc::new(ScriptedBackend::succeeding());
        let h = harness(
            &[config("a", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;
        let until = h.ledger.start_cooldown("a", Utc::now()).await.unwrap();

        let handle = fetch_url(&h.dispatcher, 1);
        wait_for_queue(&h.dispatcher, 1).await;

        assert!(!h.dispatcher.drain_one(), "cooling down, nothing to redrive");
        assert_eq!(h.dispatcher.queue().len(), 1);

        assert!(h.ledger.is_eligible("a", until));
        // Move the cooldown window into the past
        h.ledger
            .start_cooldown("a", Utc::now() - chrono::Duration::seconds(120))
            .await
            .unwrap();

        assert!(h.dispatcher.drain_one());
        let fetched = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(fetched.route, Route::Credential("a".into()));
    }

    #[tokio::test]
    async fn full_queue_rejects_with_service_unavailable() {
        let h = harness(
            &[config("a", Tier::Free)],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            None,
            Some(1),
        )
        .await;
        h.ledger.start_cooldown("a", Utc::now()).await.unwrap();

        let waiting = fetch_url(&h.dispatcher, 1);
        wait_for_queue(&h.dispatcher, 1).await;

        let err = h
            .dispatcher
            .fetch("https://example.com/2".into(), "req_2".into())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueFull(1)));
        assert_eq!(err.status(), Some(503));
        waiting.abort();
    }

    #[tokio::test]
    async fn concurrent_dispatches_respect_concurrency_cap() {
        let policy = QuotaPolicy {
            max_concurrency: 2,
            ..QuotaPolicy::default()
        };
        let backend = Arc::new(GatedBackend::new());
        let h = harness(
            &[config("a", Tier::Free)],
            policy,
            Arc::new(FailingDirect),
            backend.clone(),
            None,
            None,
        )
        .await;

        let handles: Vec<_> = (0..6).map(|n| fetch_url(&h.dispatcher, n)).collect();
        wait_for_queue(&h.dispatcher, 4).await;
        assert_eq!(h.ledger.state("a").unwrap().active_requests, 2);

        backend.gate.add_permits(100);
        // Waiters are redriven one per success; the drain cascade serves all of them
        for handle in handles {
            let fetched = tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(fetched.route, Route::Credential("a".into()));
        }
        assert_eq!(h.ledger.state("a").unwrap().active_requests, 0);
    }

    #[tokio::test]
    async fn summary_reports_pool_condition() {
        let policy = QuotaPolicy {
            free_quota: 1,
            ..QuotaPolicy::default()
        };
        let h = harness(
            &[config("a", Tier::Free), config("b", Tier::Free), config("c", Tier::Free)],
            policy,
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            None,
            Some(10),
        )
        .await;
        let now = Utc::now();

        let summary = h.dispatcher.summary(now);
        assert_eq!(summary.status, PoolStatus::Healthy);
        assert_eq!(summary.eligible, 3);
        assert_eq!(summary.max_pending, Some(10));

        h.ledger.start_cooldown("a", now).await.unwrap();
        h.ledger.try_acquire("b", 1).await.unwrap();
        h.ledger.release("b").await;

        let summary = h.dispatcher.summary(now);
        assert_eq!(summary.status, PoolStatus::Degraded);
        assert_eq!((summary.cooling_down, summary.exhausted, summary.eligible), (1, 1, 1));
        assert!(summary.is_ready());

        h.ledger.start_cooldown("c", now).await.unwrap();
        let summary = h.dispatcher.summary(now);
        assert_eq!(summary.status, PoolStatus::Unhealthy);
        assert!(!summary.is_ready());
    }

    #[tokio::test]
    async fn empty_pool_summary_depends_on_fallback() {
        let with_fallback = harness(
            &[],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            Some(Arc::new(CountingFallback::new(Ok(Bytes::new())))),
            None,
        )
        .await;
        assert_eq!(with_fallback.dispatcher.summary(Utc::now()).status, PoolStatus::Healthy);

        let without = harness(
            &[],
            QuotaPolicy::default(),
            Arc::new(FailingDirect),
            Arc::new(ScriptedBackend::succeeding()),
            None,
            None,
        )
        .await;
        assert_eq!(without.dispatcher.summary(Utc::now()).status, PoolStatus::Unhealthy);
    }
}
