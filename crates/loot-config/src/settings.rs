//! Typed view over the merged config document.
//!
//! Every section and field has a default so an empty document is a valid,
//! conservative config. `LootConfig::from_json` validates ranges after
//! deserializing; out-of-range values fail loading rather than being clamped.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use loot_schemas::{RateLimitPolicy, RewardLimits, TrustDirection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const MIN_NONCE_TTL_SECS: u32 = 60;
pub const MAX_NONCE_TTL_SECS: u32 = 180;

const MAX_RECONCILE_CONCURRENCY: usize = 64;
const MAX_RETRY_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LootConfig {
    pub rate_limits: RateLimits,
    pub nonce: NonceSettings,
    pub claims: ClaimSettings,
    pub gateway: GatewaySettings,
    pub reconcile: ReconcileSettings,
    pub daemon: DaemonSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimits {
    pub nonce_issue: RateLimitPolicy,
    pub claim_submit: RateLimitPolicy,
    pub item_batch: RateLimitPolicy,
    pub item_lock: RateLimitPolicy,
    pub account_read: RateLimitPolicy,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            nonce_issue: RateLimitPolicy::mutating(60, 20),
            claim_submit: RateLimitPolicy::mutating(60, 20),
            item_batch: RateLimitPolicy::mutating(60, 30),
            item_lock: RateLimitPolicy::mutating(60, 30),
            account_read: RateLimitPolicy::read(60, 120),
        }
    }
}

impl RateLimits {
    /// Longest configured window. A bucket whose window started earlier than
    /// this before now can no longer affect any decision.
    pub fn longest_window_secs(&self) -> u32 {
        self.all()
            .iter()
            .map(|(_, p)| p.window_secs)
            .max()
            .unwrap_or(0)
    }

    fn all(&self) -> [(&'static str, &RateLimitPolicy); 5] {
        [
            ("nonce_issue", &self.nonce_issue),
            ("claim_submit", &self.claim_submit),
            ("item_batch", &self.item_batch),
            ("item_lock", &self.item_lock),
            ("account_read", &self.account_read),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NonceSettings {
    pub ttl_secs: u32,
}

impl Default for NonceSettings {
    fn default() -> Self {
        Self { ttl_secs: 120 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimSettings {
    /// Upper bound on any single store call made while applying a claim.
    pub store_timeout_ms: u64,
    pub max_currency_delta: u64,
    pub max_experience_delta: u64,
    pub max_items_per_claim: u32,
}

impl Default for ClaimSettings {
    fn default() -> Self {
        let lim = RewardLimits::default();
        Self {
            store_timeout_ms: 5_000,
            max_currency_delta: lim.max_currency_delta,
            max_experience_delta: lim.max_experience_delta,
            max_items_per_claim: lim.max_items_per_claim,
        }
    }
}

impl ClaimSettings {
    pub fn reward_limits(&self) -> RewardLimits {
        RewardLimits {
            max_currency_delta: self.max_currency_delta,
            max_experience_delta: self.max_experience_delta,
            max_items_per_claim: self.max_items_per_claim,
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewaySettings {
    /// How long a completed fingerprint keeps suppressing identical submits.
    pub completion_ttl_ms: u64,
    pub request_timeout_ms: u64,
    /// Sleep before each retry; its length is the retry budget.
    pub retry_backoff_ms: Vec<u64>,
}

impl Default for GatewaySettings {
    fn default() -> Self {
        Self {
            completion_ttl_ms: 5_000,
            request_timeout_ms: 10_000,
            retry_backoff_ms: vec![1_000, 2_000, 3_000],
        }
    }
}

impl GatewaySettings {
    pub fn retry_backoff(&self) -> Vec<Duration> {
        self.retry_backoff_ms
            .iter()
            .map(|ms| Duration::from_millis(*ms))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcileSettings {
    pub direction: TrustDirection,
    pub concurrency: usize,
    /// 0 disables the scheduled sweep in the daemon.
    pub interval_secs: u64,
}

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            direction: TrustDirection::Snapshot,
            concurrency: 4,
            interval_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Env var NAME holding the operator bearer token.
    pub admin_token_env: String,
    /// Env var NAME holding the Postgres URL.
    pub database_url_env: String,
    pub request_timeout_ms: u64,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            admin_token_env: "LOOT_ADMIN_TOKEN".to_string(),
            database_url_env: "LOOT_DATABASE_URL".to_string(),
            request_timeout_ms: 15_000,
        }
    }
}

impl LootConfig {
    pub fn from_json(v: &Value) -> Result<Self> {
        let cfg: LootConfig =
            serde_json::from_value(v.clone()).context("config does not match LootConfig")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        let ttl = self.nonce.ttl_secs;
        if !(MIN_NONCE_TTL_SECS..=MAX_NONCE_TTL_SECS).contains(&ttl) {
            bail!(
                "CONFIG_INVALID nonce.ttl_secs={ttl}: expected {MIN_NONCE_TTL_SECS}..={MAX_NONCE_TTL_SECS}"
            );
        }
        for (name, p) in self.rate_limits.all() {
            if p.window_secs == 0 || p.max_requests == 0 {
                bail!("CONFIG_INVALID rate_limits.{name}: window_secs and max_requests must be > 0");
            }
        }
        let c = self.reconcile.concurrency;
        if c == 0 || c > MAX_RECONCILE_CONCURRENCY {
            bail!("CONFIG_INVALID reconcile.concurrency={c}: expected 1..={MAX_RECONCILE_CONCURRENCY}");
        }
        if self.gateway.retry_backoff_ms.len() > MAX_RETRY_ATTEMPTS {
            bail!(
                "CONFIG_INVALID gateway.retry_backoff_ms: at most {MAX_RETRY_ATTEMPTS} retries"
            );
        }
        if self.claims.store_timeout_ms == 0
            || self.gateway.request_timeout_ms == 0
            || self.daemon.request_timeout_ms == 0
        {
            bail!("CONFIG_INVALID timeouts must be > 0 (every call carries a deadline)");
        }
        if self.claims.max_items_per_claim == 0 {
            bail!("CONFIG_INVALID claims.max_items_per_claim must be > 0");
        }
        Ok(())
    }
}
