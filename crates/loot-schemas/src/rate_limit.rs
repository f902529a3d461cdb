use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::Identity;

/// Endpoint names used as rate-limit bucket keys.
pub mod endpoints {
    pub const NONCE_ISSUE: &str = "nonce.issue";
    pub const CLAIM_SUBMIT: &str = "claim.submit";
    pub const ITEM_BATCH: &str = "items.batch";
    pub const ITEM_LOCK: &str = "items.lock";
    pub const ACCOUNT_READ: &str = "account.read";
}

/// Decides what happens when the bucket store itself is unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointClass {
    /// Claim-sensitive or state-changing: deny on store error.
    #[default]
    Mutating,
    /// Non-mutating read: allow on store error.
    Read,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub window_secs: u32,
    pub max_requests: u32,
    #[serde(default)]
    pub class: EndpointClass,
}

impl RateLimitPolicy {
    pub const fn mutating(window_secs: u32, max_requests: u32) -> Self {
        Self {
            window_secs,
            max_requests,
            class: EndpointClass::Mutating,
        }
    }

    pub const fn read(window_secs: u32, max_requests: u32) -> Self {
        Self {
            window_secs,
            max_requests,
            class: EndpointClass::Read,
        }
    }

    /// Start of the fixed window containing `now`.
    ///
    /// Windows are aligned to the Unix epoch so every service instance
    /// computes the same boundary for the same instant.
    pub fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let w = i64::from(self.window_secs.max(1));
        let secs = now.timestamp();
        let start = secs - secs.rem_euclid(w);
        Utc.timestamp_opt(start, 0).single().unwrap_or(now)
    }
}

/// Persisted counter for one (identity, endpoint) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitBucket {
    pub identity: Identity,
    pub endpoint: String,
    pub window_start: DateTime<Utc>,
    pub count: u32,
}
