use std::sync::Arc;
use std::time::Duration;

use loot_db::{ClaimApply, LedgerInsert, NonceRejection, Store, StoreError};
use loot_schemas::{
    endpoints, ClaimOutcome, ClaimRecord, ClaimRequest, Clock, Identity, RateLimitPolicy,
    RejectReason, RewardLimits,
};
use tracing::{error, info, warn};

use crate::{reject_reason_for, within, ClaimLedger, NonceError, NonceIssuer, RateLimiter};

pub const MAX_CLAIM_KEY_LEN: usize = 256;

/// Applies reward claims exactly once per claim key.
///
/// Order: payload validation, rate limit, account lookup, nonce consumption,
/// then the ledger insert and reward mutation as one transaction. Effects are additive only;
/// nothing here decrements a balance or destroys an instance.
pub struct ClaimApplier {
    store: Arc<dyn Store>,
    limiter: Arc<RateLimiter>,
    nonces: Arc<NonceIssuer>,
    ledger: Arc<ClaimLedger>,
    clock: Arc<dyn Clock>,
    submit_policy: RateLimitPolicy,
    limits: RewardLimits,
    timeout: Duration,
}

impl ClaimApplier {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        limiter: Arc<RateLimiter>,
        nonces: Arc<NonceIssuer>,
        ledger: Arc<ClaimLedger>,
        clock: Arc<dyn Clock>,
        submit_policy: RateLimitPolicy,
        limits: RewardLimits,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            limiter,
            nonces,
            ledger,
            clock,
            submit_policy,
            limits,
            timeout,
        }
    }

    pub async fn apply(&self, req: &ClaimRequest) -> ClaimOutcome {
        match self.apply_inner(req).await {
            Ok(outcome) => outcome,
            Err(reason) => {
                warn!(
                    identity = %req.identity,
                    claim_key = %req.claim_key,
                    reason = reason.as_str(),
                    "claim rejected"
                );
                ClaimOutcome::Rejected { reason }
            }
        }
    }

    async fn apply_inner(&self, req: &ClaimRequest) -> Result<ClaimOutcome, RejectReason> {
        let identity = &req.identity;
        let claim_key = req.claim_key.trim();
        if claim_key.is_empty() || claim_key.len() > MAX_CLAIM_KEY_LEN {
            return Err(RejectReason::InvalidPayload);
        }

        // Validate before any store call: a malformed payload neither burns
        // the nonce nor spends submit budget.
        let reward = req.reward.validate(&self.limits).map_err(|e| {
            warn!(%identity, claim_key, error = %e, "invalid reward payload");
            RejectReason::InvalidPayload
        })?;

        if !self
            .limiter
            .check(identity, endpoints::CLAIM_SUBMIT, &self.submit_policy)
            .await
        {
            return Err(RejectReason::RateLimited);
        }

        let account = within(self.timeout, self.store.fetch_account(identity))
            .await
            .map_err(|e| store_reject(identity, "account lookup", &e))?;
        if account.is_none() {
            return Err(RejectReason::IdentityUnverified);
        }

        match self.nonces.consume(&req.nonce, identity).await {
            Ok(nonce) => {
                if nonce.session_ref != req.session_ref.trim() {
                    warn!(%identity, claim_key, "nonce session_ref mismatch");
                    return Err(RejectReason::InvalidNonce);
                }
            }
            Err(NonceError::Rejected(r)) => return self.replay_or_reject(identity, claim_key, r).await,
            Err(NonceError::Store(e)) => return Err(store_reject(identity, "consume nonce", &e)),
        }

        let applied_at = self.clock.now();
        let inserted = self
            .ledger
            .try_insert(ClaimApply {
                identity,
                claim_key,
                reward: &reward,
                applied_at,
            })
            .await
            .map_err(|e| store_reject(identity, "apply claim", &e))?;

        match inserted {
            LedgerInsert::Inserted(rec) => {
                info!(
                    %identity,
                    claim_key,
                    currency = rec.result.currency_granted,
                    experience = rec.result.experience_granted,
                    items = rec.result.item_types.len(),
                    "claim applied"
                );
                Ok(ClaimOutcome::Applied {
                    result: rec.result,
                    duplicate: false,
                })
            }
            LedgerInsert::AlreadyExists(rec) => settled(identity, rec, reward.fingerprint()),
        }
    }

    /// The nonce is unusable: spent, expired, purged after expiry, or not
    /// this identity's. If this claim key already settled for the same
    /// identity, the caller is a retry that lost the first response: hand
    /// back the stored result. Otherwise surface the nonce problem.
    async fn replay_or_reject(
        &self,
        identity: &Identity,
        claim_key: &str,
        rejection: NonceRejection,
    ) -> Result<ClaimOutcome, RejectReason> {
        let nonce_reason = match rejection {
            NonceRejection::AlreadyConsumed => RejectReason::NonceAlreadyConsumed,
            NonceRejection::Expired => RejectReason::NonceExpired,
            NonceRejection::NotFound | NonceRejection::IdentityMismatch => {
                RejectReason::InvalidNonce
            }
        };

        match self.ledger.lookup(claim_key).await {
            Ok(Some(rec)) => {
                let fp = rec.payload_fingerprint.clone();
                settled(identity, rec, &fp)
            }
            Ok(None) => Err(nonce_reason),
            Err(e) => Err(store_reject(identity, "replay lookup", &e)),
        }
    }
}

/// A claim key that is already in the ledger.
fn settled(
    identity: &Identity,
    rec: ClaimRecord,
    fingerprint: &str,
) -> Result<ClaimOutcome, RejectReason> {
    if &rec.identity != identity {
        warn!(%identity, owner = %rec.identity, claim_key = %rec.claim_key, "claim key held by another identity");
        return Err(RejectReason::ClaimKeyConflict);
    }
    if rec.payload_fingerprint != fingerprint {
        warn!(%identity, claim_key = %rec.claim_key, "duplicate claim with a different payload; returning stored result");
    }
    info!(%identity, claim_key = %rec.claim_key, "duplicate claim; returning stored result");
    Ok(ClaimOutcome::Applied {
        result: rec.result,
        duplicate: true,
    })
}

fn store_reject(identity: &Identity, step: &'static str, e: &StoreError) -> RejectReason {
    let reason = reject_reason_for(e);
    if matches!(e, StoreError::Constraint(_) | StoreError::Corrupt(_)) {
        error!(%identity, step, error = %e, "claim store failure");
    } else {
        warn!(%identity, step, error = %e, "claim store failure");
    }
    reason
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use loot_db::{MemStore, Store};
    use loot_schemas::{ConsumableKind, ManualClock, RewardItem, RewardPayload};

    struct Fixture {
        clock: ManualClock,
        store: Arc<MemStore>,
        nonces: Arc<NonceIssuer>,
        applier: ClaimApplier,
    }

    fn fixture(submit_max: u32) -> Fixture {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemStore::new());
        let timeout = Duration::from_secs(1);
        let limiter = Arc::new(RateLimiter::new(
            store.clone(),
            Arc::new(clock.clone()),
            timeout,
        ));
        let nonces = Arc::new(NonceIssuer::new(
            store.clone(),
            Arc::new(clock.clone()),
            limiter.clone(),
            chrono::Duration::seconds(60),
            RateLimitPolicy::mutating(60, 100),
            timeout,
        ));
        let ledger = Arc::new(ClaimLedger::new(store.clone(), timeout));
        let applier = ClaimApplier::new(
            store.clone(),
            limiter,
            nonces.clone(),
            ledger,
            Arc::new(clock.clone()),
            RateLimitPolicy::mutating(60, submit_max),
            RewardLimits::default(),
            timeout,
        );
        Fixture {
            clock,
            store,
            nonces,
            applier,
        }
    }

    fn potions(n: u32) -> RewardPayload {
        RewardPayload {
            currency_delta: 100,
            experience_delta: 7,
            items: vec![RewardItem::Consumable {
                kind: ConsumableKind::Potion,
                quantity: n,
            }],
        }
    }

    impl Fixture {
        async fn player(&self, name: &str) -> Identity {
            let id = Identity::new(name).unwrap();
            self.store
                .register_account(&id, self.clock.now())
                .await
                .unwrap();
            id
        }

        async fn request(&self, who: &Identity, key: &str, reward: RewardPayload) -> ClaimRequest {
            let issued = self.nonces.issue(who, "sess").await.unwrap();
            ClaimRequest {
                identity: who.clone(),
                claim_key: key.to_string(),
                nonce: issued.nonce,
                session_ref: "sess".into(),
                reward,
            }
        }

        async fn balance(&self, who: &Identity) -> i64 {
            self.store.fetch_account(who).await.unwrap().unwrap().balance
        }
    }

    #[tokio::test]
    async fn fresh_claim_applies_reward() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let req = f.request(&who, "quest:1", potions(2)).await;

        let out = f.applier.apply(&req).await;
        let ClaimOutcome::Applied { result, duplicate } = out else {
            panic!("expected applied, got {out:?}");
        };
        assert!(!duplicate);
        assert_eq!(result.balance_after, 100);
        assert_eq!(result.instance_ids.len(), 2);
        assert_eq!(f.balance(&who).await, 100);
    }

    #[tokio::test]
    async fn same_key_with_fresh_nonce_returns_stored_result() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let first = f.applier.apply(&f.request(&who, "quest:1", potions(1)).await).await;
        let second = f.applier.apply(&f.request(&who, "quest:1", potions(1)).await).await;

        assert_eq!(first.result(), second.result());
        assert!(matches!(second, ClaimOutcome::Applied { duplicate: true, .. }));
        assert_eq!(f.balance(&who).await, 100);
    }

    #[tokio::test]
    async fn replay_with_spent_then_expired_nonce_is_exactly_once() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let req = f.request(&who, "boss:7", potions(1)).await;

        let first = f.applier.apply(&req).await;
        assert!(first.is_applied());

        // lost response: client resends the same request
        let again = f.applier.apply(&req).await;
        assert_eq!(again.result(), first.result());

        f.clock.advance_secs(120);
        let late = f.applier.apply(&req).await;
        assert_eq!(late.result(), first.result());
        assert_eq!(f.balance(&who).await, 100);
    }

    #[tokio::test]
    async fn spent_nonce_for_unsettled_key_is_rejected() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let req = f.request(&who, "a", potions(1)).await;
        assert!(f.applier.apply(&req).await.is_applied());

        let reuse = ClaimRequest {
            claim_key: "b".into(),
            ..req
        };
        assert_eq!(
            f.applier.apply(&reuse).await.reject_reason(),
            Some(RejectReason::NonceAlreadyConsumed)
        );
    }

    #[tokio::test]
    async fn expired_nonce_is_rejected() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let req = f.request(&who, "a", potions(1)).await;
        f.clock.advance_secs(61);
        assert_eq!(
            f.applier.apply(&req).await.reject_reason(),
            Some(RejectReason::NonceExpired)
        );
        assert_eq!(f.balance(&who).await, 0);
    }

    #[tokio::test]
    async fn unknown_nonce_and_wrong_session_are_invalid() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let mut req = f.request(&who, "a", potions(1)).await;

        let bogus = ClaimRequest {
            nonce: "deadbeef".into(),
            ..req.clone()
        };
        assert_eq!(
            f.applier.apply(&bogus).await.reject_reason(),
            Some(RejectReason::InvalidNonce)
        );

        req.session_ref = "other-session".into();
        assert_eq!(
            f.applier.apply(&req).await.reject_reason(),
            Some(RejectReason::InvalidNonce)
        );
    }

    #[tokio::test]
    async fn claim_key_of_another_identity_conflicts() {
        let f = fixture(20);
        let alice = f.player("alice").await;
        let mallory = f.player("mallory").await;
        assert!(f
            .applier
            .apply(&f.request(&alice, "shared", potions(1)).await)
            .await
            .is_applied());
        let out = f
            .applier
            .apply(&f.request(&mallory, "shared", potions(1)).await)
            .await;
        assert_eq!(out.reject_reason(), Some(RejectReason::ClaimKeyConflict));
        assert_eq!(f.balance(&mallory).await, 0);
    }

    #[tokio::test]
    async fn invalid_payload_does_not_burn_the_nonce() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let mut req = f.request(&who, "a", potions(0)).await;
        assert_eq!(
            f.applier.apply(&req).await.reject_reason(),
            Some(RejectReason::InvalidPayload)
        );
        req.reward = potions(1);
        assert!(f.applier.apply(&req).await.is_applied());
    }

    #[tokio::test]
    async fn submit_is_rate_limited() {
        let f = fixture(1);
        let who = f.player("p1").await;
        assert!(f
            .applier
            .apply(&f.request(&who, "a", potions(1)).await)
            .await
            .is_applied());
        let out = f.applier.apply(&f.request(&who, "b", potions(1)).await).await;
        assert_eq!(out.reject_reason(), Some(RejectReason::RateLimited));
    }

    #[tokio::test]
    async fn unregistered_identity_is_unverified() {
        let f = fixture(20);
        let ghost = Identity::new("ghost").unwrap();
        let req = ClaimRequest {
            identity: ghost.clone(),
            claim_key: "a".into(),
            nonce: "deadbeef".into(),
            session_ref: "sess".into(),
            reward: potions(1),
        };
        assert_eq!(
            f.applier.apply(&req).await.reject_reason(),
            Some(RejectReason::IdentityUnverified)
        );
        assert_eq!(f.store.fetch_account(&ghost).await.unwrap(), None);
    }

    #[tokio::test]
    async fn invalid_payload_does_not_spend_submit_budget() {
        let f = fixture(1);
        let who = f.player("p1").await;
        let bad = f.request(&who, "a", potions(0)).await;
        assert_eq!(
            f.applier.apply(&bad).await.reject_reason(),
            Some(RejectReason::InvalidPayload)
        );
        assert!(f
            .applier
            .apply(&f.request(&who, "a", potions(1)).await)
            .await
            .is_applied());
    }

    #[tokio::test]
    async fn replay_after_nonce_purge_returns_stored_result() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let req = f.request(&who, "boss:9", potions(1)).await;
        let first = f.applier.apply(&req).await;
        assert!(first.is_applied());

        f.clock.advance_secs(121);
        assert_eq!(f.store.purge_expired_nonces(f.clock.now()).await.unwrap(), 1);

        let late = f.applier.apply(&req).await;
        assert!(matches!(late, ClaimOutcome::Applied { duplicate: true, .. }));
        assert_eq!(late.result(), first.result());
        assert_eq!(f.balance(&who).await, 100);
    }

    #[tokio::test]
    async fn purged_nonce_for_unsettled_key_is_invalid() {
        let f = fixture(20);
        let who = f.player("p1").await;
        let req = f.request(&who, "never-applied", potions(1)).await;
        f.clock.advance_secs(121);
        f.store.purge_expired_nonces(f.clock.now()).await.unwrap();
        assert_eq!(
            f.applier.apply(&req).await.reject_reason(),
            Some(RejectReason::InvalidNonce)
        );
    }
}
