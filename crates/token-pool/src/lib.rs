//! Token-pool scheduler for the scrape proxy
//!
//! Multiplexes a bounded set of third-party scraping credentials across
//! concurrent fetch requests. Each credential has a quota ceiling (by tier), a
//! cap on in-flight calls, and a cooldown window after rate limiting. A request
//! is tried directly first, then through a ladder of escalating cost tiers on
//! one credential at a time, premium credentials before free ones. When every
//! credential is busy, spent, or cooling down the request waits in a FIFO
//! queue; when no credential is configured at all it goes to the fallback
//! backend.
//!
//! Ledger state is mirrored to a `KvStore` after every mutation so a restart
//! resumes spent quota.

pub mod credential;
pub mod dispatch;
pub mod error;
pub mod ladder;
pub mod ledger;
pub mod maintenance;
pub mod pool;
pub mod queue;
pub mod selector;

pub use credential::{CredentialConfig, CredentialState, Tier};
pub use dispatch::{Dispatcher, Fetched, PoolStatus, PoolSummary, Route};
pub use error::{Error, Result};
pub use ladder::{Ladder, LadderTier};
pub use ledger::{DEFAULT_KEY_PREFIX, Ledger, QuotaPolicy};
pub use maintenance::{MaintenanceIntervals, reset_cycle, spawn_maintenance};
pub use pool::CredentialPool;
pub use queue::{PendingQueue, PendingRequest};
pub use selector::select_eligible;
