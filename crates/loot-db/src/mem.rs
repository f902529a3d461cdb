use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

#[cfg(feature = "testkit")]
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use loot_schemas::{
    Account, BatchOutcome, ClaimNonce, ClaimRecord, ClaimResult, Identity, ItemInstance, ItemOp,
    RateLimitBucket, RateLimitPolicy, RefusalReason, RemoveRefusal,
};
use uuid::Uuid;

use crate::store::{
    reward_instances, BucketHit, ClaimApply, LedgerInsert, NonceConsume, NonceRejection,
    Registration, Store, StoreError,
};

#[derive(Debug, Default)]
struct MemState {
    accounts: BTreeMap<Identity, Account>,
    instances: BTreeMap<Uuid, ItemInstance>,
    nonces: HashMap<String, ClaimNonce>,
    ledger: HashMap<String, ClaimRecord>,
    buckets: HashMap<(Identity, String), RateLimitBucket>,
}

/// In-process [`Store`].
///
/// Every method holds the single state lock for its whole body, which gives
/// the same atomicity the Postgres store gets from conditional writes and
/// transactions. Multi-step writes are staged and only committed once every
/// step has succeeded.
#[derive(Debug, Default)]
pub struct MemStore {
    state: Mutex<MemState>,
    #[cfg(feature = "testkit")]
    commit_fault: AtomicBool,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Seed an instance directly, bypassing the batch primitive. Tests use
    /// this to build drift the reconciler must repair.
    pub fn seed_instance(&self, inst: ItemInstance) {
        self.lock().instances.insert(inst.instance_id, inst);
    }

    /// Make the next reward transaction fail after staging every write and
    /// before commit.
    #[cfg(feature = "testkit")]
    pub fn inject_commit_fault(&self) {
        self.commit_fault.store(true, Ordering::SeqCst);
    }

    fn take_commit_fault(&self) -> bool {
        #[cfg(feature = "testkit")]
        {
            self.commit_fault.swap(false, Ordering::SeqCst)
        }
        #[cfg(not(feature = "testkit"))]
        {
            false
        }
    }
}

#[async_trait::async_trait]
impl Store for MemStore {
    fn kind(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn register_account(
        &self,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<Registration, StoreError> {
        let mut st = self.lock();
        if let Some(existing) = st.accounts.get(identity) {
            return Ok(Registration {
                account: existing.clone(),
                created: false,
            });
        }
        let account = Account::new(identity.clone(), now);
        st.accounts.insert(identity.clone(), account.clone());
        Ok(Registration {
            account,
            created: true,
        })
    }

    async fn fetch_account(&self, identity: &Identity) -> Result<Option<Account>, StoreError> {
        Ok(self.lock().accounts.get(identity).cloned())
    }

    async fn list_identities(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.lock().accounts.keys().cloned().collect())
    }

    async fn replace_snapshot(
        &self,
        identity: &Identity,
        snapshot: &[String],
    ) -> Result<(), StoreError> {
        let mut st = self.lock();
        let acct = st
            .accounts
            .get_mut(identity)
            .ok_or_else(|| StoreError::NotFound(format!("account {identity}")))?;
        acct.snapshot = snapshot.to_vec();
        Ok(())
    }

    async fn rate_limit_hit(
        &self,
        identity: &Identity,
        endpoint: &str,
        policy: &RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<BucketHit, StoreError> {
        let window_start = policy.window_start(now);
        let mut guard = self.lock();
        let st = &mut *guard;
        let key = (identity.clone(), endpoint.to_string());
        match st.buckets.get_mut(&key) {
            None => {
                st.buckets.insert(
                    key,
                    RateLimitBucket {
                        identity: identity.clone(),
                        endpoint: endpoint.to_string(),
                        window_start,
                        count: 1,
                    },
                );
                Ok(BucketHit::Counted { count: 1 })
            }
            Some(b) if b.window_start < window_start => {
                b.window_start = window_start;
                b.count = 1;
                Ok(BucketHit::Counted { count: 1 })
            }
            Some(b) if b.count < policy.max_requests => {
                b.count += 1;
                Ok(BucketHit::Counted { count: b.count })
            }
            Some(_) => Ok(BucketHit::Exhausted),
        }
    }

    async fn insert_nonce(&self, nonce: &ClaimNonce) -> Result<(), StoreError> {
        let mut st = self.lock();
        if !st.accounts.contains_key(&nonce.identity) {
            return Err(StoreError::Constraint(format!(
                "claim_nonces.identity references missing account {}",
                nonce.identity
            )));
        }
        if st.nonces.contains_key(&nonce.token) {
            return Err(StoreError::Constraint("claim_nonces.token not unique".into()));
        }
        st.nonces.insert(nonce.token.clone(), nonce.clone());
        Ok(())
    }

    async fn consume_nonce(
        &self,
        token: &str,
        identity: &Identity,
        now: DateTime<Utc>,
    ) -> Result<NonceConsume, StoreError> {
        let mut st = self.lock();
        let Some(n) = st.nonces.get_mut(token) else {
            return Ok(NonceConsume::Rejected(NonceRejection::NotFound));
        };
        if &n.identity != identity {
            return Ok(NonceConsume::Rejected(NonceRejection::IdentityMismatch));
        }
        if n.consumed {
            return Ok(NonceConsume::Rejected(NonceRejection::AlreadyConsumed));
        }
        if n.is_expired(now) {
            return Ok(NonceConsume::Rejected(NonceRejection::Expired));
        }
        let prior = n.clone();
        n.consumed = true;
        Ok(NonceConsume::Consumed(prior))
    }

    async fn purge_stale_buckets(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut st = self.lock();
        let n = st.buckets.len();
        st.buckets.retain(|_, b| b.window_start >= before);
        Ok((n - st.buckets.len()) as u64)
    }

    async fn purge_expired_nonces(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut st = self.lock();
        let n = st.nonces.len();
        st.nonces.retain(|_, v| v.expires_at >= before);
        Ok((n - st.nonces.len()) as u64)
    }

    async fn find_claim(&self, claim_key: &str) -> Result<Option<ClaimRecord>, StoreError> {
        Ok(self.lock().ledger.get(claim_key).cloned())
    }

    async fn apply_claim(&self, req: ClaimApply<'_>) -> Result<LedgerInsert, StoreError> {
        let mut st = self.lock();

        let Some(current) = st.accounts.get(req.identity) else {
            return Err(StoreError::NotFound(format!("account {}", req.identity)));
        };
        if let Some(prior) = st.ledger.get(req.claim_key) {
            return Ok(LedgerInsert::AlreadyExists(prior.clone()));
        }

        // Stage.
        let mut account = current.clone();
        account.balance = account
            .balance
            .checked_add(req.reward.currency_delta())
            .ok_or_else(|| StoreError::Constraint("accounts.balance overflow".into()))?;
        account.experience = account
            .experience
            .checked_add(req.reward.experience_delta())
            .ok_or_else(|| StoreError::Constraint("accounts.experience overflow".into()))?;
        account
            .snapshot
            .extend(req.reward.item_types().iter().cloned());
        let instances = reward_instances(req.reward, req.identity, req.applied_at);

        let record = ClaimRecord {
            claim_key: req.claim_key.to_string(),
            identity: req.identity.clone(),
            applied_at: req.applied_at,
            payload_fingerprint: req.reward.fingerprint().to_string(),
            result: ClaimResult {
                claim_key: req.claim_key.to_string(),
                currency_granted: req.reward.currency_delta(),
                experience_granted: req.reward.experience_delta(),
                item_types: req.reward.item_types().to_vec(),
                instance_ids: instances.iter().map(|i| i.instance_id).collect(),
                balance_after: account.balance,
                experience_after: account.experience,
                applied_at: req.applied_at,
            },
        };

        if self.take_commit_fault() {
            return Err(StoreError::Transient("injected commit fault".into()));
        }

        // Commit.
        st.accounts.insert(req.identity.clone(), account);
        for inst in instances {
            st.instances.insert(inst.instance_id, inst);
        }
        st.ledger.insert(req.claim_key.to_string(), record.clone());
        Ok(LedgerInsert::Inserted(record))
    }

    async fn list_instances(&self, identity: &Identity) -> Result<Vec<ItemInstance>, StoreError> {
        let st = self.lock();
        let mut out: Vec<ItemInstance> = st
            .instances
            .values()
            .filter(|i| &i.owner == identity)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.instance_id.cmp(&b.instance_id))
        });
        Ok(out)
    }

    async fn apply_item_batch(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
        now: DateTime<Utc>,
    ) -> Result<BatchOutcome, StoreError> {
        let mut st = self.lock();
        if !st.accounts.contains_key(identity) {
            return Err(StoreError::NotFound(format!("account {identity}")));
        }

        let mut out = BatchOutcome::default();
        for op in ops {
            match op {
                ItemOp::Add {
                    item_type,
                    expires_at,
                } => {
                    let mut inst = ItemInstance::new(item_type.clone(), identity.clone(), now);
                    inst.expires_at = *expires_at;
                    out.added.push(inst.instance_id);
                    st.instances.insert(inst.instance_id, inst);
                }
                ItemOp::Remove { instance_id } => {
                    let reason = match st.instances.get(instance_id) {
                        Some(i) if &i.owner != identity => Some(RefusalReason::NotOwned),
                        Some(i) if i.locked => Some(RefusalReason::Locked),
                        Some(_) => None,
                        None => Some(RefusalReason::NotOwned),
                    };
                    match reason {
                        None => {
                            st.instances.remove(instance_id);
                            out.removed.push(*instance_id);
                        }
                        Some(reason) => out.refused.push(RemoveRefusal {
                            instance_id: *instance_id,
                            reason,
                        }),
                    }
                }
            }
        }
        Ok(out)
    }

    async fn set_instance_lock(
        &self,
        identity: &Identity,
        instance_id: Uuid,
        locked: bool,
    ) -> Result<ItemInstance, StoreError> {
        let mut st = self.lock();
        match st.instances.get_mut(&instance_id) {
            Some(inst) if &inst.owner == identity => {
                inst.locked = locked;
                Ok(inst.clone())
            }
            _ => Err(StoreError::NotFound(format!(
                "instance {instance_id} owned by {identity}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use loot_schemas::{RewardItem, RewardLimits, RewardPayload};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().unwrap()
    }

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let s = MemStore::new();
        let a = s.register_account(&id("p1"), t0()).await.unwrap();
        assert!(a.created);
        let b = s
            .register_account(&id("p1"), t0() + chrono::Duration::seconds(5))
            .await
            .unwrap();
        assert!(!b.created);
        assert_eq!(a.account, b.account);
    }

    #[tokio::test]
    async fn purge_drops_only_stale_buckets() {
        let s = MemStore::new();
        let p = RateLimitPolicy::mutating(60, 5);
        s.rate_limit_hit(&id("ghost-1"), "nonce.issue", &p, t0()).await.unwrap();
        s.rate_limit_hit(&id("ghost-2"), "account.read", &p, t0()).await.unwrap();
        let later = t0() + chrono::Duration::seconds(300);
        s.rate_limit_hit(&id("p1"), "nonce.issue", &p, later).await.unwrap();

        let cutoff = later - chrono::Duration::seconds(60);
        assert_eq!(s.purge_stale_buckets(cutoff).await.unwrap(), 2);
        assert_eq!(s.purge_stale_buckets(cutoff).await.unwrap(), 0);

        // The surviving bucket still counts within its window.
        assert_eq!(
            s.rate_limit_hit(&id("p1"), "nonce.issue", &p, later).await.unwrap(),
            BucketHit::Counted { count: 2 }
        );
    }

    #[tokio::test]
    async fn bucket_stops_at_ceiling_and_resets_on_new_window() {
        let s = MemStore::new();
        let p = RateLimitPolicy::mutating(60, 2);
        let who = id("p1");
        let later = t0() + chrono::Duration::seconds(60);
        let mut seen = Vec::new();
        for at in [t0(), t0(), t0(), later, t0()] {
            seen.push(s.rate_limit_hit(&who, "x", &p, at).await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                BucketHit::Counted { count: 1 },
                BucketHit::Counted { count: 2 },
                BucketHit::Exhausted,
                BucketHit::Counted { count: 1 },
                // a lagging clock counts into the newer window, never drags it back
                BucketHit::Counted { count: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn claim_appends_snapshot_and_creates_instances() {
        let s = MemStore::new();
        let who = id("p1");
        s.register_account(&who, t0()).await.unwrap();
        let reward = RewardPayload {
            currency_delta: 25,
            experience_delta: 0,
            items: vec![RewardItem::Card {
                card_id: "drake".into(),
                quantity: 2,
            }],
        }
        .validate(&RewardLimits::default())
        .unwrap();

        let req = ClaimApply {
            identity: &who,
            claim_key: "k1",
            reward: &reward,
            applied_at: t0(),
        };
        let first = s.apply_claim(req).await.unwrap();
        assert!(matches!(first, LedgerInsert::Inserted(_)));
        let again = s.apply_claim(req).await.unwrap();
        assert_eq!(again, LedgerInsert::AlreadyExists(first.record().clone()));

        let acct = s.fetch_account(&who).await.unwrap().unwrap();
        assert_eq!(acct.balance, 25);
        assert_eq!(acct.snapshot, vec!["card:drake", "card:drake"]);
        assert_eq!(s.list_instances(&who).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn batch_refuses_locked_and_foreign_instances() {
        let s = MemStore::new();
        let (a, b) = (id("a"), id("b"));
        s.register_account(&a, t0()).await.unwrap();
        s.register_account(&b, t0()).await.unwrap();

        let added = s
            .apply_item_batch(&a, &[ItemOp::add("chest:rare"), ItemOp::add("chest:rare")], t0())
            .await
            .unwrap();
        let (x, y) = (added.added[0], added.added[1]);
        s.set_instance_lock(&a, x, true).await.unwrap();

        let out = s
            .apply_item_batch(&b, &[ItemOp::remove(y)], t0())
            .await
            .unwrap();
        assert_eq!(out.refused[0].reason, RefusalReason::NotOwned);

        let out = s
            .apply_item_batch(&a, &[ItemOp::remove(x), ItemOp::remove(y)], t0())
            .await
            .unwrap();
        assert_eq!(out.removed, vec![y]);
        assert_eq!(out.refused.len(), 1);
        assert_eq!(out.refused[0].reason, RefusalReason::Locked);
        assert_eq!(s.list_instances(&a).await.unwrap().len(), 1);
    }
}
