//! Fetch attempt ladder
//!
//! Drives one request through escalating cost tiers against one credential.
//! Each tier is charged before the outbound call and its in-flight slot is
//! released after it, whatever the outcome. Costs are never refunded.

use bytes::Bytes;
use chrono::Utc;
use tracing::{debug, info};
use upstream::{ScrapeBackend, UpstreamError};

use crate::error::{Error, Result};
use crate::ledger::Ledger;

/// One rung of the ladder: extra query parameters and their quota cost.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LadderTier {
    pub name: String,
    pub cost: u64,
    pub params: Vec<(String, String)>,
}

impl LadderTier {
    pub fn new(name: &str, cost: u64, params: &[(&str, &str)]) -> Self {
        Self {
            name: name.to_string(),
            cost,
            params: params
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ladder {
    tiers: Vec<LadderTier>,
}

impl Default for Ladder {
    /// Plain, geo-pinned, rendered, then premium proxy.
    fn default() -> Self {
        Self {
            tiers: vec![
                LadderTier::new("plain", 1, &[]),
                LadderTier::new("geo", 1, &[("country_code", "us")]),
                LadderTier::new("render", 5, &[("render", "true")]),
                LadderTier::new("premium", 10, &[("premium", "true")]),
            ],
        }
    }
}

impl Ladder {
    pub fn new(tiers: Vec<LadderTier>) -> Result<Self> {
        if tiers.is_empty() {
            return Err(Error::InvalidLadder("at least one tier is required".into()));
        }
        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[LadderTier] {
        &self.tiers
    }

    /// Run the ladder for `url` on credential `id`.
    ///
    /// Returns the first successful body. A 429 cools the credential down and
    /// aborts with `RateLimited`; quota or concurrency rejection aborts before
    /// the rejected tier is attempted; any other failure moves to the next
    /// tier. Exhausting every tier yields `Outbound` with the last error.
    pub async fn run(
        &self,
        ledger: &Ledger,
        backend: &dyn ScrapeBackend,
        id: &str,
        api_key: &str,
        url: &str,
    ) -> Result<Bytes> {
        let mut last_error: Option<UpstreamError> = None;

        for tier in &self.tiers {
            ledger.try_acquire(id, tier.cost).await?;

            debug!(
                credential_id = id,
                tier = %tier.name,
                cost = tier.cost,
                backend = backend.id(),
                "ladder attempt"
            );
            let result = backend.scrape(api_key, url, &tier.params).await;
            ledger.release(id).await;

            match result {
                Ok(body) => {
                    record_attempt(tier, "success");
                    return Ok(body);
                }
                Err(e) if e.is_rate_limited() => {
                    record_attempt(tier, "rate_limited");
                    let until = ledger.start_cooldown(id, Utc::now()).await?;
                    info!(credential_id = id, tier = %tier.name, "rate limited, abandoning ladder");
                    return Err(Error::RateLimited {
                        credential_id: id.to_string(),
                        until,
                    });
                }
                Err(e) => {
                    record_attempt(tier, "failure");
                    debug!(credential_id = id, tier = %tier.name, error = %e, "tier failed, escalating");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.map_or_else(
            || Error::InvalidLadder("ladder has no tiers".into()),
            Error::Outbound,
        ))
    }
}

fn record_attempt(tier: &LadderTier, result: &'static str) {
    metrics::counter!(
        "ladder_attempts_total",
        "tier" => tier.name.clone(),
        "result" => result
    )
    .increment(1);
}
