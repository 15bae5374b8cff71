//! Configured credential pool, partitioned by tier

use std::collections::HashMap;

use common::Secret;

use crate::credential::{CredentialConfig, Tier};

/// The set of configured credentials. Premium ids are tried before free ids.
///
/// Fixed at startup; quota and cooldown state lives in the `Ledger`.
#[derive(Debug, Default)]
pub struct CredentialPool {
    premium: Vec<String>,
    free: Vec<String>,
    keys: HashMap<String, Secret<String>>,
}

impl CredentialPool {
    pub fn from_configs(credentials: &[CredentialConfig]) -> Self {
        let mut pool = Self::default();
        for config in credentials {
            match config.tier {
                Tier::Premium => pool.premium.push(config.id.clone()),
                Tier::Free => pool.free.push(config.id.clone()),
            }
            pool.keys.insert(config.id.clone(), config.api_key.clone());
        }
        pool
    }

    /// True when no credential is configured at all (as opposed to all
    /// credentials being unavailable right now).
    pub fn is_empty(&self) -> bool {
        self.premium.is_empty() && self.free.is_empty()
    }

    pub fn len(&self) -> usize {
        self.premium.len() + self.free.len()
    }

    pub fn premium(&self) -> &[String] {
        &self.premium
    }

    pub fn free(&self) -> &[String] {
        &self.free
    }

    pub fn api_key(&self, id: &str) -> Option<&Secret<String>> {
        self.keys.get(id)
    }
}
