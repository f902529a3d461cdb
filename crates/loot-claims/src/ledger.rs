use std::sync::Arc;
use std::time::Duration;

use loot_db::{ClaimApply, LedgerInsert, Store, StoreError};
use loot_schemas::ClaimRecord;

use crate::within;

/// The exactly-once gate.
///
/// `try_insert` inserts the ledger row and applies the reward in one store
/// transaction; uniqueness on the claim key is enforced by the store itself.
/// A key that is already settled comes back as `AlreadyExists` with the
/// stored record, and nothing is mutated.
pub struct ClaimLedger {
    store: Arc<dyn Store>,
    timeout: Duration,
}

impl ClaimLedger {
    pub fn new(store: Arc<dyn Store>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub async fn try_insert(&self, req: ClaimApply<'_>) -> Result<LedgerInsert, StoreError> {
        within(self.timeout, self.store.apply_claim(req)).await
    }

    /// Read-only lookup of a settled claim.
    pub async fn lookup(&self, claim_key: &str) -> Result<Option<ClaimRecord>, StoreError> {
        within(self.timeout, self.store.find_claim(claim_key)).await
    }
}
