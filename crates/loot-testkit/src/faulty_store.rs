use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use loot_db::{BucketHit, ClaimApply, LedgerInsert, NonceConsume, Registration, Store, StoreError};
use loot_schemas::{
    Account, BatchOutcome, ClaimNonce, ClaimRecord, Identity, ItemInstance, ItemOp,
    RateLimitPolicy,
};
use uuid::Uuid;

/// Store operations a fault can be attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreCall {
    Ping,
    Register,
    FetchAccount,
    ListIdentities,
    ReplaceSnapshot,
    RateLimit,
    InsertNonce,
    ConsumeNonce,
    PurgeNonces,
    PurgeBuckets,
    FindClaim,
    ApplyClaim,
    ListInstances,
    ApplyItemBatch,
    SetLock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Fail immediately with `StoreError::Transient`.
    Transient,
    /// Never answer. Callers only get out through their own deadline.
    Hang,
    /// Answer normally after the delay.
    Delay(Duration),
}

#[derive(Debug, Clone, Copy)]
struct Armed {
    fault: Fault,
    once: bool,
}

type FaultKey = (StoreCall, Option<Identity>);

#[derive(Default)]
struct Faults {
    armed: HashMap<FaultKey, Armed>,
    calls: HashMap<StoreCall, usize>,
}

/// Test-only [`Store`] wrapper that injects failures in front of a real
/// store. Faults are keyed by operation and optionally by identity, so one
/// account can fail while the rest of a batch goes through.
pub struct FaultyStore {
    inner: Arc<dyn Store>,
    faults: Mutex<Faults>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Every `call` fails with `fault` until cleared.
    pub fn fail(&self, call: StoreCall, fault: Fault) {
        self.arm((call, None), fault, false);
    }

    /// Only the next `call` fails.
    pub fn fail_once(&self, call: StoreCall, fault: Fault) {
        self.arm((call, None), fault, true);
    }

    /// Every `call` made on behalf of `identity` fails until cleared.
    pub fn fail_for(&self, identity: &Identity, call: StoreCall, fault: Fault) {
        self.arm((call, Some(identity.clone())), fault, false);
    }

    pub fn clear(&self) {
        self.lock().armed.clear();
    }

    /// How many times `call` reached this wrapper, faulted or not.
    pub fn calls(&self, call: StoreCall) -> usize {
        self.lock().calls.get(&call).copied().unwrap_or(0)
    }

    fn arm(&self, key: FaultKey, fault: Fault, once: bool) {
        self.lock().armed.insert(key, Armed { fault, once });
    }

    fn take(&self, call: StoreCall, identity: Option<&Identity>) -> Option<Fault> {
        let mut f = self.lock();
        *f.calls.entry(call).or_insert(0) += 1;

        let scoped = identity.map(|id| (call, Some(id.clone())));
        let key = match scoped {
            Some(k) if f.armed.contains_key(&k) => k,
            _ => (call, None),
        };
        let armed = f.armed.get(&key).copied()?;
        if armed.once {
            f.armed.remove(&key);
        }
        Some(armed.fault)
    }

    async fn gate(&self, call: StoreCall, identity: Option<&Identity>) -> Result<(), StoreError> {
        match self.take(call, identity) {
            None => Ok(()),
            Some(Fault::Transient) => Err(StoreError::Transient(format!("injected fault on {call:?}"))),
            Some(Fault::Hang) => {
                std::future::pending::<()>().await;
                Err(StoreError::Timeout)
            }
            Some(Fault::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl Store for FaultyStore {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.gate(StoreCall::Ping, None).await?;
        self.inner.ping().await
    }

    async fn register_account(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        self.gate(StoreCall::Register, Some(identity)).await?;
        self.inner.register_account(identity, now).await
    }

    async fn fetch_account(&self, identity: &Identity) -> Result<Option<Account>, StoreError> {
        self.gate(StoreCall::FetchAccount, Some(identity)).await?;
        self.inner.fetch_account(identity).await
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        self.gate(StoreCall::ListIdentities, None).await?;
        self.inner.list_identities().await
    }

    async fn replace_snapshot(
        &self,
        identity: &Identity,
        snapshot: &[String],
    ) -> Result<(), StoreError> {
        self.gate(StoreCall::ReplaceSnapshot, Some(identity)).await?;
        self.inner.replace_snapshot(identity, snapshot).await
    }

    async fn rate_limit_hit(
        &self,
        identity: &Identity,
        endpoint: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketHit, StoreError> {
        self.gate(StoreCall::RateLimit, Some(identity)).await?;
        self.inner.rate_limit_hit(identity, endpoint, policy, now).await
    }

    async fn purge_stale_buckets(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.gate(StoreCall::PurgeBuckets, None).await?;
        self.inner.purge_stale_buckets(before).await
    }

    async fn insert_nonce(&self, nonce: &ClaimNonce) -> Result<(), StoreError> {
        self.gate(StoreCall::InsertNonce, Some(&nonce.identity)).await?;
        self.inner.insert_nonce(nonce).await
    }

    async fn consume_nonce(
        &self,
        token: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<NonceConsume, StoreError> {
        self.gate(StoreCall::ConsumeNonce, Some(identity)).await?;
        self.inner.consume_nonce(token, identity, now).await
    }

    async fn purge_expired_nonces(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        self.gate(StoreCall::PurgeNonces, None).await?;
        self.inner.purge_expired_nonces(before).await
    }

    async fn find_claim(&self, claim_key: &str) -> Result<Option<ClaimRecord>, StoreError> {
        self.gate(StoreCall::FindClaim, None).await?;
        self.inner.find_claim(claim_key).await
    }

    async fn apply_claim(&self, req: ClaimApply<'_>) -> Result<LedgerInsert, StoreError> {
        self.gate(StoreCall::ApplyClaim, Some(req.identity)).await?;
        self.inner.apply_claim(req).await
    }

    async fn list_instances(&self, identity: &Identity) -> Result<Vec<ItemInstance>, StoreError> {
        self.gate(StoreCall::ListInstances, Some(identity)).await?;
        self.inner.list_instances(identity).await
    }

    async fn apply_item_batch(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, StoreError> {
        self.gate(StoreCall::ApplyItemBatch, Some(identity)).await?;
        self.inner.apply_item_batch(identity, ops, now).await
    }

    async fn set_instance_lock(
        &self,
        identity: &Identity,
        instance_id: Uuid,
        locked: bool,
    ) -> Result<ItemInstance, StoreError> {
        self.gate(StoreCall::SetLock, Some(identity)).await?;
        self.inner.set_instance_lock(identity, instance_id, locked).await
    }
}
