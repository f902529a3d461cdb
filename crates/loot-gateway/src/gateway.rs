use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use loot_config::GatewaySettings;
use loot_schemas::{
    fingerprint_value, BatchOutcome, ClaimOutcome, Clock, Identity, ItemOp, RewardPayload,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::client::ClaimClient;
use crate::guard::{GuardState, GuardStore, PendingMutationGuard};
use crate::transport::{Transport, TransportError};

/// A client-initiated server mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Mutation {
    Claim {
        claim_key: String,
        session_ref: String,
        reward: RewardPayload,
    },
    ItemBatch {
        ops: Vec<ItemOp>,
    },
}

impl Mutation {
    /// Fingerprint over the normalized payload.
    ///
    /// Claims are identified by key and canonical reward; the session is left
    /// out so two tabs reporting the same event collide. Batch ops are
    /// order-insensitive.
    pub fn fingerprint(&self) -> String {
        let normalized = match self {
            Mutation::Claim {
                claim_key, reward, ..
            } => json!({
                "kind": "claim",
                "claim_key": claim_key.trim(),
                "reward": reward.canonical(),
            }),
            Mutation::ItemBatch { ops } => {
                let mut encoded: Vec<Value> = ops
                    .iter()
                    .map(|op| serde_json::to_value(op).unwrap_or(Value::Null))
                    .collect();
                encoded.sort_by_key(|v| v.to_string());
                json!({ "kind": "item_batch", "ops": encoded })
            }
        };
        fingerprint_value(&normalized)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "outcome", rename_all = "snake_case")]
pub enum MutationResult {
    Claim(ClaimOutcome),
    Items(BatchOutcome),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SkipReason {
    InFlight,
    RecentDuplicate,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::InFlight => "IN_FLIGHT",
            SkipReason::RecentDuplicate => "RECENT_DUPLICATE",
        }
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Submission {
    Dispatched(Result<MutationResult, TransportError>),
    Skipped(SkipReason),
}

impl Submission {
    pub fn skip_reason(&self) -> Option<SkipReason> {
        match self {
            Submission::Skipped(r) => Some(*r),
            Submission::Dispatched(_) => None,
        }
    }
}

type GuardKey = (Identity, String);

/// Suppresses redundant client-side resubmits.
///
/// State is a map from (identity, fingerprint) to in-flight/completed, kept
/// in process and mirrored to a [`GuardStore`] shared with other client
/// instances. Nothing here guarantees delivery; it only avoids sending the
/// same thing twice within a short window.
pub struct MutationGateway {
    transport: Arc<dyn Transport>,
    claims: ClaimClient,
    shared: Arc<dyn GuardStore>,
    clock: Arc<dyn Clock>,
    local: Mutex<HashMap<GuardKey, PendingMutationGuard>>,
    completion_ttl: chrono::Duration,
    /// An in-flight guard older than this is treated as abandoned (its
    /// owner crashed or was closed mid-request).
    in_flight_ttl: chrono::Duration,
}

impl MutationGateway {
    pub fn new(
        transport: Arc<dyn Transport>,
        shared: Arc<dyn GuardStore>,
        clock: Arc<dyn Clock>,
        settings: &GatewaySettings,
    ) -> Self {
        let backoff = settings.retry_backoff();
        let per_attempt = 2 * settings.request_timeout_ms;
        let in_flight_ms = per_attempt * (backoff.len() as u64 + 1)
            + settings.retry_backoff_ms.iter().sum::<u64>();
        Self {
            claims: ClaimClient::new(transport.clone(), backoff),
            transport,
            shared,
            clock,
            local: Mutex::new(HashMap::new()),
            completion_ttl: millis(settings.completion_ttl_ms),
            in_flight_ttl: millis(in_flight_ms),
        }
    }

    pub async fn submit(&self, identity: &Identity, mutation: &Mutation) -> Submission {
        let fingerprint = mutation.fingerprint();
        let key = (identity.clone(), fingerprint);

        if let Some(reason) = self.try_begin(&key) {
            info!(%identity, fingerprint = %key.1, reason = reason.as_str(), "mutation skipped");
            return Submission::Skipped(reason);
        }
        let _done = CompleteOnDrop { gw: self, key: &key };

        let res = match mutation {
            Mutation::Claim {
                claim_key,
                session_ref,
                reward,
            } => self
                .claims
                .claim(identity, session_ref, claim_key, reward)
                .await
                .map(MutationResult::Claim),
            Mutation::ItemBatch { ops } => self
                .transport
                .batch_items(identity, ops)
                .await
                .map(MutationResult::Items),
        };
        if let Err(e) = &res {
            warn!(%identity, error = %e, "mutation dispatch failed");
        }
        Submission::Dispatched(res)
    }

    /// Check both guard layers; if clear, mark the key in flight.
    fn try_begin(&self, key: &GuardKey) -> Option<SkipReason> {
        let now = self.clock.now();
        let mut local = self.lock();

        if let Some(reason) = local.get(key).and_then(|g| self.blocks(g, now)) {
            return Some(reason);
        }
        match self.shared.get(&key.0, &key.1) {
            Ok(Some(g)) => {
                if let Some(reason) = self.blocks(&g, now) {
                    return Some(reason);
                }
            }
            Ok(None) => {}
            Err(e) => warn!(error = %e, "shared guard store unreadable; using process guard only"),
        }

        let guard = PendingMutationGuard {
            fingerprint: key.1.clone(),
            identity: key.0.clone(),
            at: now,
            state: GuardState::InFlight,
        };
        self.publish(&guard);
        local.insert(key.clone(), guard);
        None
    }

    fn complete(&self, key: &GuardKey) {
        let guard = PendingMutationGuard {
            fingerprint: key.1.clone(),
            identity: key.0.clone(),
            at: self.clock.now(),
            state: GuardState::Completed,
        };
        self.publish(&guard);
        self.lock().insert(key.clone(), guard);
    }

    fn blocks(&self, g: &PendingMutationGuard, now: DateTime<Utc>) -> Option<SkipReason> {
        let age = now - g.at;
        match g.state {
            GuardState::InFlight if age < self.in_flight_ttl => Some(SkipReason::InFlight),
            GuardState::Completed if age < self.completion_ttl => Some(SkipReason::RecentDuplicate),
            _ => None,
        }
    }

    fn publish(&self, guard: &PendingMutationGuard) {
        if let Err(e) = self.shared.put(guard) {
            warn!(error = %e, "shared guard store write failed");
        }
    }

    /// Forget guards that can no longer suppress anything.
    pub fn prune(&self) {
        let now = self.clock.now();
        let horizon = now - self.completion_ttl.max(self.in_flight_ttl);
        let mut local = self.lock();
        local.retain(|_, g| g.at >= horizon);
        match self.shared.prune(horizon) {
            Ok(n) if n > 0 => debug!(removed = n, "pruned shared guards"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "shared guard prune failed"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<GuardKey, PendingMutationGuard>> {
        self.local.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Records completion even if the submit future is dropped mid-dispatch.
struct CompleteOnDrop<'a> {
    gw: &'a MutationGateway,
    key: &'a GuardKey,
}

impl Drop for CompleteOnDrop<'_> {
    fn drop(&mut self) {
        self.gw.complete(self.key);
    }
}

fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::MemGuardStore;
    use async_trait::async_trait;
    use loot_schemas::{Account, ClaimRequest, IssuedNonce, ManualClock};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Counts batch calls; each call parks until released.
    #[derive(Default)]
    struct Parked {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Transport for Parked {
        async fn register(&self, _identity: &Identity) -> Result<Account, TransportError> {
            Err(TransportError::Timeout)
        }

        async fn request_nonce(
            &self,
            _identity: &Identity,
            _session_ref: &str,
        ) -> Result<IssuedNonce, TransportError> {
            Err(TransportError::Timeout)
        }

        async fn submit_claim(&self, _req: &ClaimRequest) -> Result<ClaimOutcome, TransportError> {
            Err(TransportError::Timeout)
        }

        async fn batch_items(
            &self,
            _identity: &Identity,
            _ops: &[ItemOp],
        ) -> Result<BatchOutcome, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.started.notify_one();
            self.release.notified().await;
            Ok(BatchOutcome::default())
        }
    }

    fn gateway(t: Arc<Parked>, shared: Arc<MemGuardStore>, clock: &ManualClock) -> MutationGateway {
        MutationGateway::new(t, shared, Arc::new(clock.clone()), &GatewaySettings::default())
    }

    fn batch(types: &[&str]) -> Mutation {
        Mutation::ItemBatch {
            ops: types.iter().map(|t| ItemOp::add(*t)).collect(),
        }
    }

    #[test]
    fn batch_fingerprint_ignores_op_order() {
        assert_eq!(
            batch(&["a", "b"]).fingerprint(),
            batch(&["b", "a"]).fingerprint()
        );
        assert_ne!(batch(&["a"]).fingerprint(), batch(&["a", "a"]).fingerprint());
    }

    #[tokio::test]
    async fn identical_submit_while_in_flight_is_skipped() {
        let t = Arc::new(Parked::default());
        let clock = ManualClock::starting_now();
        let gw = gateway(t.clone(), Arc::new(MemGuardStore::new()), &clock);
        let who = Identity::new("p1").unwrap();
        let m = batch(&["consumable:potion"]);

        let first = gw.submit(&who, &m);
        let second = async {
            t.started.notified().await;
            let s = gw.submit(&who, &m).await;
            t.release.notify_one();
            s
        };
        let (first, second) = tokio::join!(first, second);

        assert!(matches!(first, Submission::Dispatched(Ok(_))));
        assert_eq!(second.skip_reason(), Some(SkipReason::InFlight));
        assert_eq!(t.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn completed_fingerprint_suppressed_until_ttl() {
        let t = Arc::new(Parked::default());
        t.release.notify_one();
        let clock = ManualClock::starting_now();
        let gw = gateway(t.clone(), Arc::new(MemGuardStore::new()), &clock);
        let who = Identity::new("p1").unwrap();
        let m = batch(&["consumable:potion"]);

        assert!(gw.submit(&who, &m).await.skip_reason().is_none());

        clock.advance_millis(4_999);
        assert_eq!(
            gw.submit(&who, &m).await.skip_reason(),
            Some(SkipReason::RecentDuplicate)
        );

        clock.advance_millis(2);
        t.release.notify_one();
        assert!(gw.submit(&who, &m).await.skip_reason().is_none());
        assert_eq!(t.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn guard_is_per_identity() {
        let t = Arc::new(Parked::default());
        let clock = ManualClock::starting_now();
        let gw = gateway(t.clone(), Arc::new(MemGuardStore::new()), &clock);
        let m = batch(&["x"]);

        t.release.notify_one();
        gw.submit(&Identity::new("a").unwrap(), &m).await;
        t.release.notify_one();
        let other = gw.submit(&Identity::new("b").unwrap(), &m).await;
        assert!(other.skip_reason().is_none());
    }

    #[tokio::test]
    async fn second_tab_sees_first_tabs_completion() {
        let t = Arc::new(Parked::default());
        let clock = ManualClock::starting_now();
        let shared = Arc::new(MemGuardStore::new());
        let tab_a = gateway(t.clone(), shared.clone(), &clock);
        let tab_b = gateway(t.clone(), shared, &clock);
        let who = Identity::new("p1").unwrap();
        let m = batch(&["x"]);

        t.release.notify_one();
        tab_a.submit(&who, &m).await;
        assert_eq!(
            tab_b.submit(&who, &m).await.skip_reason(),
            Some(SkipReason::RecentDuplicate)
        );
    }

    #[tokio::test]
    async fn abandoned_in_flight_guard_expires() {
        let t = Arc::new(Parked::default());
        let clock = ManualClock::starting_now();
        let shared = Arc::new(MemGuardStore::new());
        let who = Identity::new("p1").unwrap();
        let m = batch(&["x"]);
        shared
            .put(&PendingMutationGuard {
                fingerprint: m.fingerprint(),
                identity: who.clone(),
                at: clock.now(),
                state: GuardState::InFlight,
            })
            .unwrap();
        let gw = gateway(t.clone(), shared, &clock);

        assert_eq!(
            gw.submit(&who, &m).await.skip_reason(),
            Some(SkipReason::InFlight)
        );
        clock.advance_secs(120);
        t.release.notify_one();
        assert!(gw.submit(&who, &m).await.skip_reason().is_none());
    }
}
