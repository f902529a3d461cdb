//! loot-schemas
//!
//! Shared domain types for the reward-claim and inventory-reconciliation
//! engine. Everything here is plain data plus pure helpers: no IO, no store
//! access, no async.
//!
//! - `account`    : Identity, Account, ItemInstance
//! - `api`        : HTTP request/response bodies
//! - `claim`      : ClaimNonce, ClaimRecord, ClaimResult, RejectReason
//! - `reward`     : typed reward payloads and their validation
//! - `items`      : batch item mutation ops and outcomes
//! - `rate_limit` : buckets, endpoint names, policies
//! - `fingerprint`: canonical JSON + SHA-256 payload fingerprints
//! - `clock`      : injectable wall clock

pub mod account;
pub mod api;
pub mod claim;
pub mod clock;
pub mod fingerprint;
pub mod items;
pub mod rate_limit;
pub mod reward;

pub use account::{Account, Identity, IdentityError, ItemInstance};
pub use api::{
    ClaimRequest, ErrorBody, ItemBatchRequest, LockRequest, NonceRequest, ReconcileRequest,
    RegisterRequest,
};
pub use claim::{
    ClaimNonce, ClaimOutcome, ClaimRecord, ClaimResult, IssuedNonce, RejectReason,
    DUPLICATE_CLAIM, PARTIAL_RECONCILIATION_FAILURE,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use fingerprint::{canonical_json, fingerprint_value};
pub use items::{BatchOutcome, ItemOp, RefusalReason, RemoveRefusal};
pub use rate_limit::{endpoints, EndpointClass, RateLimitBucket, RateLimitPolicy};
pub use reward::{
    ChestTier, ConsumableKind, PayloadError, RewardItem, RewardLimits, RewardPayload,
    ValidatedReward,
};

use serde::{Deserialize, Serialize};

/// Which representation of "what a player owns" wins when the two disagree.
///
/// `Snapshot` forces owned instances to match the account's snapshot list.
/// `Instances` rewrites the snapshot list from the owned instance set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrustDirection {
    #[default]
    Snapshot,
    Instances,
}

impl TrustDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrustDirection::Snapshot => "snapshot",
            TrustDirection::Instances => "instances",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snapshot" => Some(TrustDirection::Snapshot),
            "instances" => Some(TrustDirection::Instances),
            _ => None,
        }
    }
}
