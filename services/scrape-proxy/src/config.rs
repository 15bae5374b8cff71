//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credential API keys and the fallback token are loaded from env vars or
//! files, never stored in the TOML directly to avoid leaking secrets.

use common::{Secret, resolve_secret};
use serde::Deserialize;
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use token_pool::{CredentialConfig, LadderTier, MaintenanceIntervals, QuotaPolicy, Tier};

/// Env var holding the fallback backend token. Wins over `token_file`.
pub const FALLBACK_TOKEN_ENV: &str = "FALLBACK_TOKEN";

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub scraper: ScraperConfig,
    #[serde(default)]
    pub fallback: Option<FallbackConfig>,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub credentials: Vec<CredentialEntry>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; disabled when omitted
    #[serde(default)]
    pub admin_listen_addr: Option<SocketAddr>,
    /// Timeout applied to every outbound call
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Credentialed scraping service
#[derive(Debug, Deserialize)]
pub struct ScraperConfig {
    pub base_url: String,
    /// Query parameter carrying the API key (defaults to `api_key`)
    #[serde(default)]
    pub key_param: Option<String>,
    /// Escalation tiers; the built-in four-tier ladder when empty
    #[serde(default)]
    pub ladder: Vec<LadderEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LadderEntry {
    #[serde(default)]
    pub name: Option<String>,
    pub cost: u64,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

/// Alternate rendering backend, used when no credentials are configured
#[derive(Debug, Deserialize)]
pub struct FallbackConfig {
    pub endpoint: String,
    #[serde(skip)]
    pub token: Option<Secret<String>>,
    /// Path to a file containing the token (alternative to FALLBACK_TOKEN env var)
    #[serde(default)]
    pub token_file: Option<PathBuf>,
    /// JSON launch options forwarded verbatim
    #[serde(default)]
    pub launch: Option<String>,
    #[serde(default = "default_wait_until")]
    pub wait_until: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    File,
    Redis,
}

/// Durable ledger store
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// Redis URL (redis backend)
    #[serde(default)]
    pub url: Option<String>,
    /// Ledger file (file backend)
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Connection attempts before giving up; retries forever when omitted
    #[serde(default)]
    pub connect_retries: Option<u32>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            url: None,
            path: None,
            key_prefix: default_key_prefix(),
            connect_retries: None,
        }
    }
}

/// Quota policy, queue bound, and maintenance cadence
#[derive(Debug, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_free_quota")]
    pub free_quota: u64,
    #[serde(default = "default_premium_quota")]
    pub premium_quota: u64,
    /// Queue bound; unbounded when omitted
    #[serde(default)]
    pub max_pending: Option<usize>,
    #[serde(default = "default_reset_interval")]
    pub reset_interval_secs: u64,
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_drain_interval")]
    pub drain_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            cooldown_secs: default_cooldown(),
            free_quota: default_free_quota(),
            premium_quota: default_premium_quota(),
            max_pending: None,
            reset_interval_secs: default_reset_interval(),
            flush_interval_secs: default_flush_interval(),
            drain_interval_secs: default_drain_interval(),
        }
    }
}

/// One scraping credential
#[derive(Debug, Deserialize)]
pub struct CredentialEntry {
    pub id: String,
    pub tier: Tier,
    #[serde(default = "default_reset_day")]
    pub reset_day: u32,
    #[serde(skip)]
    pub api_key: Option<Secret<String>>,
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default)]
    pub api_key_file: Option<PathBuf>,
}

fn default_timeout() -> u64 {
    60
}

fn default_max_connections() -> usize {
    1000
}

fn default_wait_until() -> String {
    "networkidle2".into()
}

fn default_key_prefix() -> String {
    token_pool::DEFAULT_KEY_PREFIX.into()
}

fn default_max_concurrency() -> u32 {
    5
}

fn default_cooldown() -> u64 {
    60
}

fn default_free_quota() -> u64 {
    1_000
}

fn default_premium_quota() -> u64 {
    250_000
}

fn default_reset_interval() -> u64 {
    3600
}

fn default_flush_interval() -> u64 {
    60
}

fn default_drain_interval() -> u64 {
    5
}

fn default_reset_day() -> u32 {
    1
}

fn require_http_url(field: &str, url: &str) -> common::Result<()> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(common::Error::Config(format!(
            "{field} must start with http:// or https://, got: {url}"
        )));
    }
    Ok(())
}

fn require_non_zero(field: &str, value: u64) -> common::Result<()> {
    if value == 0 {
        return Err(common::Error::Config(format!(
            "{field} must be greater than 0"
        )));
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file, validate it, then resolve secrets.
    ///
    /// Secret resolution order for each credential and the fallback token:
    /// 1. env var (`api_key_env`, or FALLBACK_TOKEN)
    /// 2. file path from config
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate()?;
        config.resolve_secrets()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        require_http_url("scraper.base_url", &self.scraper.base_url)?;
        require_non_zero("timeout_secs", self.server.timeout_secs)?;
        require_non_zero("max_connections", self.server.max_connections as u64)?;
        require_non_zero("max_concurrency", self.pool.max_concurrency.into())?;
        require_non_zero("cooldown_secs", self.pool.cooldown_secs)?;
        require_non_zero("reset_interval_secs", self.pool.reset_interval_secs)?;
        require_non_zero("flush_interval_secs", self.pool.flush_interval_secs)?;
        require_non_zero("drain_interval_secs", self.pool.drain_interval_secs)?;
        if let Some(max_pending) = self.pool.max_pending {
            require_non_zero("max_pending", max_pending as u64)?;
        }

        if let Some(fallback) = &self.fallback {
            require_http_url("fallback.endpoint", &fallback.endpoint)?;
        }

        match self.store.backend {
            StoreBackend::Redis if self.store.url.is_none() => {
                return Err(common::Error::Config(
                    "store.url is required for the redis backend".into(),
                ));
            }
            StoreBackend::File if self.store.path.is_none() => {
                return Err(common::Error::Config(
                    "store.path is required for the file backend".into(),
                ));
            }
            _ => {}
        }

        let mut seen = HashSet::new();
        for credential in &self.credentials {
            if credential.id.trim().is_empty() {
                return Err(common::Error::Config("credential id must not be empty".into()));
            }
            if !seen.insert(credential.id.as_str()) {
                return Err(common::Error::Config(format!(
                    "duplicate credential id: {}",
                    credential.id
                )));
            }
            if !(1..=31).contains(&credential.reset_day) {
                return Err(common::Error::Config(format!(
                    "credential {}: reset_day must be between 1 and 31, got {}",
                    credential.id, credential.reset_day
                )));
            }
        }

        if self.credentials.is_empty() && self.fallback.is_none() {
            return Err(common::Error::Config(
                "no credentials configured: a [fallback] backend is required".into(),
            ));
        }

        Ok(())
    }

    fn resolve_secrets(&mut self) -> common::Result<()> {
        for credential in &mut self.credentials {
            credential.api_key = resolve_secret(
                credential.api_key_env.as_deref(),
                credential.api_key_file.as_deref(),
            )?;
            if credential.api_key.is_none() {
                return Err(common::Error::Config(format!(
                    "credential {}: no API key (set api_key_env or api_key_file)",
                    credential.id
                )));
            }
        }

        if let Some(fallback) = &mut self.fallback {
            fallback.token =
                resolve_secret(Some(FALLBACK_TOKEN_ENV), fallback.token_file.as_deref())?;
            if fallback.token.is_none() {
                return Err(common::Error::Config(format!(
                    "fallback token missing (set {FALLBACK_TOKEN_ENV} or fallback.token_file)"
                )));
            }
        }

        Ok(())
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("scrape-proxy.toml")
    }

    /// Credentials with their resolved API keys.
    pub fn credential_configs(&self) -> Vec<CredentialConfig> {
        self.credentials
            .iter()
            .filter_map(|entry| {
                entry.api_key.as_ref().map(|api_key| CredentialConfig {
                    id: entry.id.clone(),
                    tier: entry.tier,
                    reset_day: entry.reset_day,
                    api_key: api_key.clone(),
                })
            })
            .collect()
    }

    /// Ladder tiers from config, or the built-in ladder when none are given.
    pub fn ladder_tiers(&self) -> Vec<LadderTier> {
        if self.scraper.ladder.is_empty() {
            return token_pool::Ladder::default().tiers().to_vec();
        }
        self.scraper
            .ladder
            .iter()
            .enumerate()
            .map(|(n, entry)| LadderTier {
                name: entry.name.clone().unwrap_or_else(|| format!("tier{}", n + 1)),
                cost: entry.cost,
                params: entry
                    .params
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
            })
            .collect()
    }

    pub fn quota_policy(&self) -> QuotaPolicy {
        QuotaPolicy {
            free_quota: self.pool.free_quota,
            premium_quota: self.pool.premium_quota,
            max_concurrency: self.pool.max_concurrency,
            cooldown: Duration::from_secs(self.pool.cooldown_secs),
        }
    }

    pub fn maintenance_intervals(&self) -> MaintenanceIntervals {
        MaintenanceIntervals {
            reset: Duration::from_secs(self.pool.reset_interval_secs),
            flush: Duration::from_secs(self.pool.flush_interval_secs),
            drain: Duration::from_secs(self.pool.drain_interval_secs),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }
}
