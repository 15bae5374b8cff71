//! Credential records and billing-period arithmetic

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use common::Secret;
use serde::{Deserialize, Serialize};

/// Pricing tier of a credential. Premium credentials are selected first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Premium,
}

impl Tier {
    pub fn label(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Premium => "premium",
        }
    }
}

/// A configured credential: identity, tier, reset day, and the API key sent
/// to the scraping backend.
#[derive(Debug, Clone)]
pub struct CredentialConfig {
    pub id: String,
    pub tier: Tier,
    /// Day of month (1..=31) on which the quota resets
    pub reset_day: u32,
    pub api_key: Secret<String>,
}

/// Mutable per-credential state tracked by the ledger and mirrored to the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialState {
    pub id: String,
    pub tier: Tier,
    pub reset_day: u32,
    pub used_calls: u64,
    pub period_month: u32,
    pub period_year: i32,
    pub active_requests: u32,
    pub cooldown_until: Option<DateTime<Utc>>,
}

impl CredentialState {
    /// Default state for a credential never seen before: nothing spent,
    /// nothing in flight, billing period starting now.
    pub fn fresh(id: &str, tier: Tier, reset_day: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            tier,
            reset_day,
            used_calls: 0,
            period_month: now.month(),
            period_year: now.year(),
            active_requests: 0,
            cooldown_until: None,
        }
    }

    pub fn in_cooldown(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Whether the quota should reset at `now`: today is the reset day and the
    /// stored period is not the current month.
    ///
    /// A reset day past the end of a short month fires on that month's last day.
    pub fn reset_due(&self, now: DateTime<Utc>) -> bool {
        let effective_day = self.reset_day.min(days_in_month(now.year(), now.month()));
        now.day() == effective_day
            && (self.period_month, self.period_year) != (now.month(), now.year())
    }

    /// Start a new billing period at `now`.
    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.used_calls = 0;
        self.active_requests = 0;
        self.cooldown_until = None;
        self.period_month = now.month();
        self.period_year = now.year();
    }
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(28)
}
