//! Credential ledger
//!
//! Holds the quota, concurrency, and cooldown state of every credential and
//! mirrors it to a `KvStore` so a restart resumes spent quota instead of
//! granting it again.
//!
//! Each credential has its own lock; there is no lock across credentials. State
//! mutations are short synchronous critical sections (check-and-charge,
//! release, cooldown, reset) so no two dispatches can both pass the quota or
//! concurrency check when only one slot remains. Persistence happens after the
//! mutation, through a per-credential write lane that re-reads the latest state
//! before writing, so store writes for one credential never land out of order.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use kv_store::KvStore;
use tracing::{debug, info, warn};

use crate::credential::{CredentialConfig, CredentialState, Tier};
use crate::error::{Error, Result};

/// Default store key prefix for ledger entries.
pub const DEFAULT_KEY_PREFIX: &str = "scrape-proxy:credential:";

/// Suffix of the key holding the list of every persisted credential id.
const INDEX_SUFFIX: &str = "index";

/// Quota and concurrency policy applied to every credential.
#[derive(Debug, Clone)]
pub struct QuotaPolicy {
    pub free_quota: u64,
    pub premium_quota: u64,
    pub max_concurrency: u32,
    pub cooldown: Duration,
}

impl Default for QuotaPolicy {
    fn default() -> Self {
        Self {
            free_quota: 1_000,
            premium_quota: 250_000,
            max_concurrency: 5,
            cooldown: Duration::from_secs(60),
        }
    }
}

impl QuotaPolicy {
    pub fn quota_ceiling(&self, tier: Tier) -> u64 {
        match tier {
            Tier::Free => self.free_quota,
            Tier::Premium => self.premium_quota,
        }
    }
}

struct Entry {
    state: Mutex<CredentialState>,
    write_lane: tokio::sync::Mutex<()>,
}

impl Entry {
    fn new(state: CredentialState) -> Self {
        Self {
            state: Mutex::new(state),
            write_lane: tokio::sync::Mutex::new(()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CredentialState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

pub struct Ledger {
    entries: HashMap<String, Entry>,
    policy: QuotaPolicy,
    store: Arc<dyn KvStore>,
    key_prefix: String,
}

impl Ledger {
    /// Load every configured credential from the store, defaulting the ones
    /// never seen before.
    ///
    /// Reconciliation is idempotent: the persisted id index is unioned with
    /// the configured ids and written back, so ids dropped from config stay
    /// in the store untouched. Tier and reset day always come from config.
    /// In-flight counts are zeroed since no request survives a restart.
    ///
    /// Only store read/write failures are errors; a malformed record is
    /// logged and replaced with a fresh one.
    pub async fn load(
        credentials: &[CredentialConfig],
        policy: QuotaPolicy,
        store: Arc<dyn KvStore>,
        key_prefix: &str,
    ) -> Result<Self> {
        let now = Utc::now();
        let index_key = format!("{key_prefix}{INDEX_SUFFIX}");

        let persisted_ids: BTreeSet<String> = match store.get(&index_key).await? {
            Some(raw) => serde_json::from_str::<Vec<String>>(&raw)
                .map(|ids| ids.into_iter().collect())
                .unwrap_or_else(|e| {
                    warn!(error = %e, "malformed credential index, rebuilding");
                    BTreeSet::new()
                }),
            None => BTreeSet::new(),
        };

        let mut entries = HashMap::new();
        for config in credentials {
            let key = format!("{key_prefix}{}", config.id);
            let state = match store.get(&key).await? {
                Some(raw) => match serde_json::from_str::<CredentialState>(&raw) {
                    Ok(mut state) => {
                        state.id = config.id.clone();
                        state.tier = config.tier;
                        state.reset_day = config.reset_day;
                        state.active_requests = 0;
                        debug!(
                            credential_id = %config.id,
                            used_calls = state.used_calls,
                            "resumed credential state"
                        );
                        state
                    }
                    Err(e) => {
                        warn!(credential_id = %config.id, error = %e, "malformed credential state, resetting");
                        CredentialState::fresh(&config.id, config.tier, config.reset_day, now)
                    }
                },
                None => {
                    info!(credential_id = %config.id, tier = config.tier.label(), "new credential detected");
                    CredentialState::fresh(&config.id, config.tier, config.reset_day, now)
                }
            };
            entries.insert(config.id.clone(), Entry::new(state));
        }

        for retained in persisted_ids.iter().filter(|id| !entries.contains_key(*id)) {
            warn!(credential_id = %retained, "persisted credential not in config, retaining in store");
        }

        let ledger = Self {
            entries,
            policy,
            store,
            key_prefix: key_prefix.to_string(),
        };

        let mut index: BTreeSet<String> = persisted_ids;
        index.extend(ledger.entries.keys().cloned());
        let index_json = serde_json::to_string(&index.iter().collect::<Vec<_>>())
            .map_err(|e| Error::Store(format!("serializing credential index: {e}")))?;

        let mut batch = ledger.serialized_states()?;
        batch.push((index_key, index_json));
        ledger.store.set_many(batch).await?;

        info!(
            credentials = ledger.entries.len(),
            store = ledger.store.id(),
            "ledger loaded"
        );
        Ok(ledger)
    }

    pub fn policy(&self) -> &QuotaPolicy {
        &self.policy
    }

    pub fn quota_ceiling(&self, tier: Tier) -> u64 {
        self.policy.quota_ceiling(tier)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Current state of one credential.
    pub fn state(&self, id: &str) -> Option<CredentialState> {
        self.entries.get(id).map(|entry| entry.lock().clone())
    }

    /// Current state of every credential, sorted by id.
    pub fn states(&self) -> Vec<CredentialState> {
        let mut states: Vec<CredentialState> =
            self.entries.values().map(|entry| entry.lock().clone()).collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Whether the credential can be handed to a ladder right now: not cooling
    /// down, under its quota ceiling, and below the concurrency cap.
    pub fn is_eligible(&self, id: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        let state = entry.lock();
        !state.in_cooldown(now)
            && state.used_calls < self.policy.quota_ceiling(state.tier)
            && state.active_requests < self.policy.max_concurrency
    }

    /// Check-and-charge: verify quota and concurrency, then add `cost` to
    /// `used_calls` and take one in-flight slot, all under one lock.
    ///
    /// The check is `used_calls < ceiling`, so the charge itself may overshoot
    /// the ceiling by less than `cost`.
    pub async fn try_acquire(&self, id: &str, cost: u64) -> Result<()> {
        let entry = self.entry(id)?;
        {
            let mut state = entry.lock();
            if state.used_calls >= self.policy.quota_ceiling(state.tier) {
                return Err(Error::QuotaExceeded(id.to_string()));
            }
            if state.active_requests >= self.policy.max_concurrency {
                return Err(Error::ConcurrencyExceeded(id.to_string()));
            }
            state.used_calls += cost;
            state.active_requests += 1;
            debug!(
                credential_id = id,
                cost,
                used_calls = state.used_calls,
                active_requests = state.active_requests,
                "charged credential"
            );
        }
        self.persist(id).await;
        Ok(())
    }

    /// Give back the in-flight slot taken by `try_acquire`. Never drops below zero.
    pub async fn release(&self, id: &str) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        {
            let mut state = entry.lock();
            state.active_requests = state.active_requests.saturating_sub(1);
        }
        self.persist(id).await;
    }

    /// Put the credential in cooldown for the policy's cooldown window.
    pub async fn start_cooldown(&self, id: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let entry = self.entry(id)?;
        let cooldown = chrono::Duration::from_std(self.policy.cooldown)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let until = now + cooldown;
        entry.lock().cooldown_until = Some(until);
        metrics::counter!("credential_cooldowns_total").increment(1);
        info!(
            credential_id = id,
            cooldown_secs = self.policy.cooldown.as_secs(),
            "credential entering cooldown (rate limited)"
        );
        self.persist(id).await;
        Ok(until)
    }

    /// Reset the credential's billing period if it is due at `now`.
    ///
    /// Returns whether a reset happened. Resetting twice in the same period is
    /// a no-op.
    pub async fn reset_if_due(&self, id: &str, now: DateTime<Utc>) -> bool {
        let Some(entry) = self.entries.get(id) else {
            return false;
        };
        let previous = {
            let mut state = entry.lock();
            if !state.reset_due(now) {
                return false;
            }
            let previous = state.used_calls;
            state.reset(now);
            previous
        };
        info!(credential_id = id, previous_used_calls = previous, "quota reset");
        self.persist(id).await;
        true
    }

    /// Write one credential's current state to the store.
    ///
    /// Store failures are logged and swallowed: the logical operation that
    /// triggered the write has already happened in memory.
    pub async fn persist(&self, id: &str) {
        let Some(entry) = self.entries.get(id) else {
            return;
        };
        let _lane = entry.write_lane.lock().await;
        let snapshot = entry.lock().clone();
        let json = match serde_json::to_string(&snapshot) {
            Ok(json) => json,
            Err(e) => {
                warn!(credential_id = id, error = %e, "failed to serialize credential state");
                return;
            }
        };
        if let Err(e) = self.store.set(&self.key(id), json).await {
            warn!(credential_id = id, store = self.store.id(), error = %e, "failed to persist credential state");
            metrics::counter!("ledger_store_errors_total").increment(1);
        }
    }

    /// Flush every credential to the store in one batch.
    ///
    /// Independent of per-operation persistence; repairs any missed write.
    pub async fn snapshot_all(&self) -> Result<usize> {
        let batch = self.serialized_states()?;
        let count = batch.len();
        if let Err(e) = self.store.set_many(batch).await {
            metrics::counter!("ledger_store_errors_total").increment(1);
            return Err(e.into());
        }
        debug!(credentials = count, "ledger flushed");
        Ok(count)
    }

    /// Ids of every credential in the ledger.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn entry(&self, id: &str) -> Result<&Entry> {
        self.entries
            .get(id)
            .ok_or_else(|| Error::UnknownCredential(id.to_string()))
    }

    fn key(&self, id: &str) -> String {
        format!("{}{id}", self.key_prefix)
    }

    fn serialized_states(&self) -> Result<Vec<(String, String)>> {
        self.states()
            .into_iter()
            .map(|state| {
                serde_json::to_string(&state)
                    .map(|json| (self.key(&state.id), json))
                    .map_err(|e| Error::Store(format!("serializing credential state: {e}")))
            })
            .collect()
    }
}
