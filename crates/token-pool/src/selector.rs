//! Credential selection
//!
//! Picks uniformly at random among the eligible premium credentials, and only
//! looks at free credentials when no premium one qualifies. Eligibility is
//! re-read from the ledger on every call; nothing is cached.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::ledger::Ledger;
use crate::pool::CredentialPool;

/// Select an eligible credential, skipping ids in `exclude`.
///
/// Returns `None` when no credential in the pool qualifies.
pub fn select_eligible(
    ledger: &Ledger,
    pool: &CredentialPool,
    exclude: &HashSet<String>,
    now: DateTime<Utc>,
) -> Option<String> {
    pick_uniform(ledger, pool.premium(), exclude, now)
        .or_else(|| pick_uniform(ledger, pool.free(), exclude, now))
        .map(str::to_string)
}

/// Single-pass reservoir sample of size one over the eligible ids.
fn pick_uniform<'a>(
    ledger: &Ledger,
    ids: &'a [String],
    exclude: &HashSet<String>,
    now: DateTime<Utc>,
) -> Option<&'a str> {
    let mut chosen = None;
    let mut seen = 0u32;
    for id in ids {
        if exclude.contains(id) || !ledger.is_eligible(id, now) {
            continue;
        }
        seen += 1;
        if rand::random_range(0..seen) == 0 {
            chosen = Some(id.as_str());
        }
    }
    chosen
}
