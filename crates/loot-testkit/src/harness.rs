use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use loot_claims::{reject_reason_for, ClaimEngine};
use loot_config::LootConfig;
use loot_db::Store;
use loot_gateway::{Transport, TransportError};
use loot_schemas::{
    Account, BatchOutcome, ClaimOutcome, ClaimRequest, Clock, Identity, IssuedNonce, ItemOp,
    ManualClock, RewardItem, RewardPayload,
};

pub const SESSION: &str = "session-1";

/// A claim engine over any store, driven by a manual clock.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub clock: ManualClock,
    pub config: LootConfig,
    pub engine: ClaimEngine,
}

impl Harness {
    pub fn new(store: Arc<dyn Store>, config: LootConfig) -> Self {
        let clock = ManualClock::starting_now();
        let engine = ClaimEngine::from_config(store.clone(), Arc::new(clock.clone()), &config);
        Self {
            store,
            clock,
            config,
            engine,
        }
    }

    pub async fn register(&self, who: &str) -> anyhow::Result<Identity> {
        let identity = Identity::new(who)?;
        self.store.register_account(&identity, self.clock.now()).await?;
        Ok(identity)
    }

    pub async fn nonce(&self, identity: &Identity) -> anyhow::Result<String> {
        let issued = self
            .engine
            .nonces
            .issue(identity, SESSION)
            .await
            .map_err(|r| anyhow::anyhow!("nonce refused: {r}"))?;
        Ok(issued.nonce)
    }

    pub fn request(
        &self,
        identity: &Identity,
        claim_key: &str,
        nonce: &str,
        reward: &RewardPayload,
    ) -> ClaimRequest {
        ClaimRequest {
            identity: identity.clone(),
            claim_key: claim_key.to_string(),
            nonce: nonce.to_string(),
            session_ref: SESSION.to_string(),
            reward: reward.clone(),
        }
    }

    /// Fetch a fresh nonce and submit one claim with it.
    pub async fn claim(
        &self,
        identity: &Identity,
        claim_key: &str,
        reward: &RewardPayload,
    ) -> anyhow::Result<ClaimOutcome> {
        let nonce = self.nonce(identity).await?;
        let req = self.request(identity, claim_key, &nonce, reward);
        Ok(self.engine.applier.apply(&req).await)
    }

    pub async fn account(&self, identity: &Identity) -> anyhow::Result<Account> {
        self.store
            .fetch_account(identity)
            .await?
            .ok_or_else(|| anyhow::anyhow!("no account {identity}"))
    }
}

/// `quantity` copies of one card plus some currency.
pub fn card_reward(card_id: &str, quantity: u32, currency: u64) -> RewardPayload {
    RewardPayload {
        currency_delta: currency,
        experience_delta: 0,
        items: vec![RewardItem::Card {
            card_id: card_id.to_string(),
            quantity,
        }],
    }
}

/// [`Transport`] that calls a [`ClaimEngine`] in-process.
///
/// `lose_next_claim_responses(n)` makes the next `n` claim submissions
/// reach the engine and then report a timeout, as if the response was lost
/// on the way back.
pub struct LocalTransport {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    engine: ClaimEngine,
    lost_responses: AtomicUsize,
    claims_seen: AtomicUsize,
}

impl LocalTransport {
    pub fn new(h: &Harness) -> Self {
        Self {
            store: h.store.clone(),
            clock: Arc::new(h.clock.clone()),
            engine: h.engine.clone(),
            lost_responses: AtomicUsize::new(0),
            claims_seen: AtomicUsize::new(0),
        }
    }

    pub fn lose_next_claim_responses(&self, n: usize) {
        self.lost_responses.store(n, Ordering::SeqCst);
    }

    pub fn claims_seen(&self) -> usize {
        self.claims_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn register(&self, identity: &Identity) -> Result<Account, TransportError> {
        self.store
            .register_account(identity, self.clock.now())
            .await
            .map(|r| r.account)
            .map_err(|e| TransportError::Rejected(reject_reason_for(&e)))
    }

    async fn request_nonce(
        &self,
        identity: &Identity,
        session_ref: &str,
    ) -> Result<IssuedNonce, TransportError> {
        self.engine
            .nonces
            .issue(identity, session_ref)
            .await
            .map_err(TransportError::Rejected)
    }

    async fn submit_claim(&self, req: &ClaimRequest) -> Result<ClaimOutcome, TransportError> {
        self.claims_seen.fetch_add(1, Ordering::SeqCst);
        let outcome = self.engine.applier.apply(req).await;
        let lose = self
            .lost_responses
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Err(TransportError::Timeout);
        }
        Ok(outcome)
    }

    async fn batch_items(
        &self,
        identity: &Identity,
        ops: &[ItemOp],
    ) -> Result<BatchOutcome, TransportError> {
        self.store
            .apply_item_batch(identity, ops, self.clock.now())
            .await
            .map_err(|e| TransportError::Rejected(reject_reason_for(&e)))
    }
}
