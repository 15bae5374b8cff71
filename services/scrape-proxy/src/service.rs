//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Runtime metrics tracked while the service is running
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// Requests currently being served, queued ones included. Reported when
    /// the drain deadline forces shutdown.
    pub in_flight: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

/// Service states.
///
/// Fields marked `dead_code` are structurally required by state transitions
/// (used in match arms for destructuring/reconstruction) but never read
/// independently.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ServiceState {
    /// Loading config
    Initializing,
    /// Opening the ledger store
    ConnectingStore {
        retries: u32,
        /// Give up after this many retries; `None` retries forever
        max_retries: Option<u32>,
        listen_addr: SocketAddr,
    },
    /// Loading the ledger and binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Accepting and serving fetch requests
    Running { listen_addr: SocketAddr },
    /// Graceful shutdown, finishing in-flight requests
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
    /// Store connection failed, waiting to retry
    Error {
        error: String,
        retries: u32,
        max_retries: Option<u32>,
        listen_addr: SocketAddr,
    },
}

/// Events that drive state transitions.
#[derive(Debug)]
pub enum ServiceEvent {
    /// Configuration parsed successfully
    ConfigLoaded {
        listen_addr: SocketAddr,
        max_retries: Option<u32>,
    },
    /// Store reachable
    StoreConnected,
    /// Store connection attempt failed
    StoreError(String),
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Every in-flight request finished
    DrainComplete,
    /// Drain deadline exceeded
    DrainTimeout,
    /// Retry backoff expired
    RetryTimer,
}

/// Actions the caller should execute after a state transition
#[derive(Debug)]
pub enum ServiceAction {
    /// Open the ledger store
    ConnectStore,
    /// Load the ledger and bind the HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Set retry timer
    ScheduleRetry { delay: Duration },
    /// Stop accepting requests and wait for in-flight ones
    BeginDrain { deadline: Instant },
    /// Flush the ledger and exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Largest backoff exponent: retries past this wait 2^6 = 64s each
const MAX_BACKOFF_EXPONENT: u32 = 6;

/// Drain timeout duration
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Exponential backoff for store connection retry `retries` (0-based).
pub fn backoff_delay(retries: u32) -> Duration {
    Duration::from_secs(2u64.pow(retries.min(MAX_BACKOFF_EXPONENT)))
}

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (
            ServiceState::Initializing,
            ServiceEvent::ConfigLoaded {
                listen_addr,
                max_retries,
            },
        ) => (
            ServiceState::ConnectingStore {
                retries: 0,
                max_retries,
                listen_addr,
            },
            ServiceAction::ConnectStore,
        ),

        // --- ConnectingStore ---
        (ServiceState::ConnectingStore { listen_addr, .. }, ServiceEvent::StoreConnected) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        (
            ServiceState::ConnectingStore {
                retries,
                max_retries,
                listen_addr,
            },
            ServiceEvent::StoreError(e),
        ) if max_retries.is_none_or(|max| retries < max) => (
            ServiceState::Error {
                error: e,
                retries,
                max_retries,
                listen_addr,
            },
            ServiceAction::ScheduleRetry {
                delay: backoff_delay(retries),
            },
        ),

        (ServiceState::ConnectingStore { .. }, ServiceEvent::StoreError(_)) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Error recovery ---
        (
            ServiceState::Error {
                retries,
                max_retries,
                listen_addr,
                ..
            },
            ServiceEvent::RetryTimer,
        ) => (
            ServiceState::ConnectingStore {
                retries: retries + 1,
                max_retries,
                listen_addr,
            },
            ServiceAction::ConnectStore,
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => {
            (ServiceState::Running { listen_addr }, ServiceAction::None)
        }

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => {
            let deadline = Instant::now() + DRAIN_TIMEOUT;
            (
                ServiceState::Draining { deadline },
                ServiceAction::BeginDrain { deadline },
            )
        }

        // --- Draining ---
        (
            ServiceState::Draining { .. },
            ServiceEvent::DrainComplete | ServiceEvent::DrainTimeout,
        ) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Any state + shutdown = stop ---
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
