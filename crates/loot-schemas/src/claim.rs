use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Identity;

/// Wire status for a claim whose key was already settled. Not an error.
pub const DUPLICATE_CLAIM: &str = "DUPLICATE_CLAIM";

/// Per-account failure code inside a reconciliation batch report.
pub const PARTIAL_RECONCILIATION_FAILURE: &str = "PARTIAL_RECONCILIATION_FAILURE";

// ---------------------------------------------------------------------------
// Nonce
// ---------------------------------------------------------------------------

/// Single-use, time-boxed challenge token scoped to one identity + session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimNonce {
    pub token: String,
    pub identity: Identity,
    pub session_ref: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub consumed: bool,
}

impl ClaimNonce {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// What the caller of `issue` gets back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedNonce {
    pub nonce: String,
    pub expires_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// The stored outcome of one applied claim.
///
/// This exact value is returned for the first application and for every
/// replay of the same claim key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResult {
    pub claim_key: String,
    pub currency_granted: i64,
    pub experience_granted: i64,
    /// Item-type keys granted, one entry per unit.
    pub item_types: Vec<String>,
    pub instance_ids: Vec<Uuid>,
    pub balance_after: i64,
    pub experience_after: i64,
    pub applied_at: DateTime<Utc>,
}

/// One row of the claim ledger. `claim_key` is globally unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRecord {
    pub claim_key: String,
    pub identity: Identity,
    pub applied_at: DateTime<Utc>,
    pub payload_fingerprint: String,
    pub result: ClaimResult,
}

// ---------------------------------------------------------------------------
// Outcome + rejection taxonomy
// ---------------------------------------------------------------------------

/// Result of `ClaimApplier::apply`.
///
/// A duplicate claim is `Applied { duplicate: true }` carrying the original
/// result; callers present it exactly like a fresh grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClaimOutcome {
    Applied { result: ClaimResult, duplicate: bool },
    Rejected { reason: RejectReason },
}

impl ClaimOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ClaimOutcome::Applied { .. })
    }

    pub fn result(&self) -> Option<&ClaimResult> {
        match self {
            ClaimOutcome::Applied { result, .. } => Some(result),
            ClaimOutcome::Rejected { .. } => None,
        }
    }

    pub fn reject_reason(&self) -> Option<RejectReason> {
        match self {
            ClaimOutcome::Applied { .. } => None,
            ClaimOutcome::Rejected { reason } => Some(*reason),
        }
    }
}

/// Why a nonce, claim or mutation request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectReason {
    InvalidNonce,
    NonceExpired,
    NonceAlreadyConsumed,
    RateLimited,
    IdentityUnverified,
    InvalidPayload,
    /// The claim key is already settled under a different identity.
    ClaimKeyConflict,
    TransientStoreError,
    Timeout,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::InvalidNonce => "INVALID_NONCE",
            RejectReason::NonceExpired => "NONCE_EXPIRED",
            RejectReason::NonceAlreadyConsumed => "NONCE_ALREADY_CONSUMED",
            RejectReason::RateLimited => "RATE_LIMITED",
            RejectReason::IdentityUnverified => "IDENTITY_UNVERIFIED",
            RejectReason::InvalidPayload => "INVALID_PAYLOAD",
            RejectReason::ClaimKeyConflict => "CLAIM_KEY_CONFLICT",
            RejectReason::TransientStoreError => "TRANSIENT_STORE_ERROR",
            RejectReason::Timeout => "TIMEOUT",
        }
    }

    /// Only store-side hiccups are worth retrying. Everything else is terminal
    /// for the attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RejectReason::TransientStoreError | RejectReason::Timeout
        )
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for RejectReason {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reject_reason_wire_codes_match_display() {
        let all = [
            RejectReason::InvalidNonce,
            RejectReason::NonceExpired,
            RejectReason::NonceAlreadyConsumed,
            RejectReason::RateLimited,
            RejectReason::IdentityUnverified,
            RejectReason::InvalidPayload,
            RejectReason::ClaimKeyConflict,
            RejectReason::TransientStoreError,
            RejectReason::Timeout,
        ];
        for r in all {
            let wire = serde_json::to_value(r).unwrap();
            assert_eq!(wire, serde_json::Value::String(r.as_str().to_string()));
            assert_eq!(r.to_string(), r.as_str());
        }
    }

    #[test]
    fn only_store_failures_are_retryable() {
        assert!(RejectReason::TransientStoreError.is_retryable());
        assert!(RejectReason::Timeout.is_retryable());
        assert!(!RejectReason::RateLimited.is_retryable());
        assert!(!RejectReason::NonceAlreadyConsumed.is_retryable());
    }

    #[test]
    fn rejected_outcome_serializes_with_status_tag() {
        let out = ClaimOutcome::Rejected {
            reason: RejectReason::NonceExpired,
        };
        let v = serde_json::to_value(&out).unwrap();
        assert_eq!(v["status"], "REJECTED");
        assert_eq!(v["reason"], "NONCE_EXPIRED");
    }
}
