//! The transactional store boundary.
//!
//! Everything the claim flow and the reconciler need from persistence goes
//! through [`Store`]. Each method is one atomic unit: either a single
//! conditional write or one transaction. Callers never compose read-then-write
//! sequences across methods for anything that must hold under concurrency.

use std::fmt;

use chrono::{DateTime, Utc};
use loot_schemas::{
    Account, BatchOutcome, ClaimNonce, ClaimRecord, Identity, ItemInstance, ItemOp,
    RateLimitPolicy, ValidatedReward,
};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Connection, IO, serialization conflict. Safe to retry.
    Transient(String),
    /// The call exceeded its deadline. Safe to retry.
    Timeout,
    /// A constraint rejected the write.
    Constraint(String),
    /// A row the operation requires does not exist.
    NotFound(String),
    /// Stored data failed to decode.
    Corrupt(String),
}

impl StoreError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout)
    }

    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Transient(_) => "STORE_TRANSIENT",
            StoreError::Timeout => "STORE_TIMEOUT",
            StoreError::Constraint(_) => "STORE_CONSTRAINT",
            StoreError::NotFound(_) => "STORE_NOT_FOUND",
            StoreError::Corrupt(_) => "STORE_CORRUPT",
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Transient(m) => write!(f, "{}: {}", self.code(), m),
            StoreError::Timeout => f.write_str(self.code()),
            StoreError::Constraint(m) => write!(f, "{}: {}", self.code(), m),
            StoreError::NotFound(m) => write!(f, "{}: {}", self.code(), m),
            StoreError::Corrupt(m) => write!(f, "{}: {}", self.code(), m),
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of one counted request against a rate-limit bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketHit {
    /// Counted; `count` is the bucket value after this request.
    Counted { count: u32 },
    /// The window is already at its ceiling. Nothing was written.
    Exhausted,
}

/// Why a nonce could not be consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceRejection {
    NotFound,
    IdentityMismatch,
    AlreadyConsumed,
    Expired,
}

impl NonceRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            NonceRejection::NotFound => "NOT_FOUND",
            NonceRejection::IdentityMismatch => "IDENTITY_MISMATCH",
            NonceRejection::AlreadyConsumed => "ALREADY_CONSUMED",
            NonceRejection::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for NonceRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NonceConsume {
    /// The nonce as it was before the flip (`consumed == false`).
    Consumed(ClaimNonce),
    Rejected(NonceRejection),
}

/// Input to the reward transaction.
#[derive(Debug, Clone, Copy)]
pub struct ClaimApply<'a> {
    pub identity: &'a Identity,
    pub claim_key: &'a str,
    pub reward: &'a ValidatedReward,
    pub applied_at: DateTime<Utc>,
}

/// Outcome of the ledger insert that gates the reward transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerInsert {
    /// New entry; the reward was applied in the same transaction.
    Inserted(ClaimRecord),
    /// The key was already settled. Nothing was mutated.
    AlreadyExists(ClaimRecord),
}

impl LedgerInsert {
    pub fn record(&self) -> &ClaimRecord {
        match self {
            LedgerInsert::Inserted(r) | LedgerInsert::AlreadyExists(r) => r,
        }
    }
}

/// Whether `register_account` created the row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub account: Account,
    pub created: bool,
}

#[async_trait::async_trait]
pub trait Store: Send + Sync {
    /// Short label for status output: "postgres" or "memory".
    fn kind(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    // -- accounts ---------------------------------------------------------

    /// Create on first contact. Registering an existing identity returns it
    /// unchanged.
    async fn register_account(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError>;

    async fn fetch_account(&self, identity: &Identity) -> Result<Option<Account>, StoreError>;

    /// All identities, sorted.
    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError>;

    /// Overwrite the snapshot list. Used only by instance-trusting
    /// reconciliation.
    async fn replace_snapshot(
        &self,
        identity: &Identity,
        snapshot: &[String],
    ) -> Result<(), StoreError>;

    // -- rate limiting ----------------------------------------------------

    /// Count one request in the fixed window containing `now`.
    ///
    /// A bucket whose stored window is older than the current one resets to
    /// 1. A bucket at its ceiling is left untouched. Windows never move
    /// backward.
    async fn rate_limit_hit(
        &self,
        identity: &Identity,
        endpoint: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketHit, StoreError>;

    // -- nonces -----------------------------------------------------------

    async fn insert_nonce(&self, nonce: &ClaimNonce) -> Result<(), StoreError>;

    /// Flip `consumed` false -> true if the nonce exists, belongs to
    /// `identity`, is unconsumed and unexpired at `now`. Exactly one of any
    /// set of concurrent callers succeeds.
    async fn consume_nonce(
        &self,
        token: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<NonceConsume, StoreError>;

    /// Drop rate-limit buckets whose window started before `before`. Returns
    /// rows removed.
    async fn purge_stale_buckets(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Drop nonces that expired before `before`. Returns rows removed.
    async fn purge_expired_nonces(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;

    // -- ledger -----------------------------------------------------------

    async fn find_claim(&self, claim_key: &str) -> Result<Option<ClaimRecord>, StoreError>;

    /// Insert the ledger entry and apply the reward in one transaction.
    ///
    /// The reward adds balance and experience, appends the granted type keys
    /// to the snapshot, and creates one instance per granted unit. If the
    /// key already exists nothing is written and the stored record is
    /// returned.
    async fn apply_claim(&self, req: ClaimApply<'_>) -> Result<LedgerInsert, StoreError>;

    // -- instances --------------------------------------------------------

    async fn list_instances(&self, identity: &Identity) -> Result<Vec<ItemInstance>, StoreError>;

    /// Apply adds and removes for one account in one transaction.
    ///
    /// Only instances change; the snapshot is left alone. Removing a locked
    /// or foreign instance is refused and reported in the outcome.
    async fn apply_item_batch(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, StoreError>;

    /// Set or clear the reservation flag on an owned instance.
    async fn set_instance_lock(
        &self,
        identity: &Identity,
        instance_id: Uuid,
        locked: bool,
    ) -> Result<ItemInstance, StoreError>;
}

/// Expand a validated reward into the instances it creates.
pub(crate) fn reward_instances(
    reward: &ValidatedReward,
    owner: &Identity,
    now: DateTime<Utc>,
) -> Vec<ItemInstance> {
    reward
        .item_types()
        .iter()
        .map(|t| ItemInstance::new(t.clone(), owner.clone(), now))
        .collect()
}
