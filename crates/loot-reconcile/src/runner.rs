use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use loot_db::{Store, StoreError};
use loot_schemas::{Clock, Identity, ItemOp, TrustDirection};
use tracing::{error, info, warn};

use crate::engine::plan;
use crate::{AccountFailure, AccountReport, BatchReport, InventoryView, PerAccountResult};

async fn within<T, F>(limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .unwrap_or(Err(StoreError::Timeout))
}

/// Store-backed reconciliation.
///
/// Corrections go through `Store::apply_item_batch`, the same primitive the
/// client batch endpoint uses, so lock refusal and ownership checks apply.
pub struct Reconciler {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    direction: TrustDirection,
    concurrency: usize,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        direction: TrustDirection,
        concurrency: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            clock,
            direction,
            concurrency: concurrency.max(1),
            timeout,
        }
    }

    pub fn direction(&self) -> TrustDirection {
        self.direction
    }

    /// Same store and limits, different trust direction.
    pub fn with_direction(&self, direction: TrustDirection) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            direction,
            concurrency: self.concurrency,
            timeout: self.timeout,
        }
    }

    pub async fn reconcile(&self, identity: &Identity) -> Result<AccountReport, StoreError> {
        let account = within(self.timeout, self.store.fetch_account(identity))
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("account {identity}")))?;
        let instances = within(self.timeout, self.store.list_instances(identity)).await?;
        let view = InventoryView {
            identity: identity.clone(),
            snapshot: account.snapshot,
            instances,
        };

        let now = self.clock.now();
        let mut p = plan(&view, self.direction, now);
        let mut report = AccountReport {
            identity: identity.clone(),
            direction: self.direction,
            added: 0,
            removed: 0,
            shortfall: std::mem::take(&mut p.shortfall),
            snapshot_rewritten: false,
        };

        if !p.removals.is_empty() || !p.additions.is_empty() {
            let ops: Vec<ItemOp> = p
                .removals
                .iter()
                .map(|id| ItemOp::remove(*id))
                .chain(p.additions.iter().map(ItemOp::add))
                .collect();
            let outcome = within(
                self.timeout,
                self.store.apply_item_batch(identity, &ops, now),
            )
            .await?;
            report.added = outcome.added_count();
            report.removed = outcome.removed_count();

            // A lock taken between our read and the batch write.
            if !outcome.refused.is_empty() {
                let types: HashMap<_, _> = view
                    .instances
                    .iter()
                    .map(|i| (i.instance_id, i.item_type.as_str()))
                    .collect();
                for r in &outcome.refused {
                    if let Some(ty) = types.get(&r.instance_id) {
                        *report.shortfall.entry(ty.to_string()).or_insert(0) += 1;
                    }
                }
            }
        }

        if let Some(snapshot) = p.snapshot_rewrite.take() {
            within(self.timeout, self.store.replace_snapshot(identity, &snapshot)).await?;
            report.snapshot_rewritten = true;
        }

        if report.converged() {
            info!(
                %identity,
                direction = self.direction.as_str(),
                added = report.added,
                removed = report.removed,
                snapshot_rewritten = report.snapshot_rewritten,
                "account reconciled"
            );
        } else {
            warn!(
                %identity,
                added = report.added,
                removed = report.removed,
                shortfall = ?report.shortfall,
                "account reconciled with locked excess left in place"
            );
        }
        Ok(report)
    }

    /// Reconcile `filter`, or every account when `filter` is empty.
    ///
    /// Accounts run with bounded concurrency. A failing account is recorded
    /// and the pass continues.
    pub async fn reconcile_all(&self, filter: &[Identity]) -> Result<BatchReport, StoreError> {
        let started_at = self.clock.now();
        let identities = if filter.is_empty() {
            within(self.timeout, self.store.list_identities()).await?
        } else {
            let mut ids = filter.to_vec();
            ids.sort();
            ids.dedup();
            ids
        };

        let mut results: Vec<PerAccountResult> = stream::iter(identities)
            .map(|identity| async move {
                match self.reconcile(&identity).await {
                    Ok(report) => PerAccountResult::Reconciled(report),
                    Err(e) => {
                        error!(%identity, error = %e, "account reconciliation failed");
                        PerAccountResult::Failed(AccountFailure::new(identity, e.to_string()))
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;
        results.sort_by(|a, b| a.identity().cmp(b.identity()));

        let report = BatchReport {
            direction: self.direction,
            started_at,
            finished_at: self.clock.now(),
            results,
        };
        info!(
            accounts = report.accounts(),
            failures = report.failures(),
            added = report.total_added(),
            removed = report.total_removed(),
            "reconciliation pass finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loot_db::MemStore;
    use loot_schemas::{ItemInstance, ManualClock};

    async fn seeded(snapshot: &[&str]) -> (Arc<MemStore>, ManualClock, Identity) {
        let clock = ManualClock::starting_now();
        let store = Arc::new(MemStore::new());
        let who = Identity::new("p1").unwrap();
        store.register_account(&who, clock.now()).await.unwrap();
        let snap: Vec<String> = snapshot.iter().map(|s| s.to_string()).collect();
        store.replace_snapshot(&who, &snap).await.unwrap();
        (store, clock, who)
    }

    fn reconciler(store: &Arc<MemStore>, clock: &ManualClock, dir: TrustDirection) -> Reconciler {
        Reconciler::new(
            store.clone(),
            Arc::new(clock.clone()),
            dir,
            4,
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn instance_direction_rewrites_snapshot_only() {
        let (store, clock, who) = seeded(&["potion"]).await;
        for _ in 0..2 {
            store.seed_instance(ItemInstance::new("drake", who.clone(), clock.now()));
        }

        let r = reconciler(&store, &clock, TrustDirection::Instances)
            .reconcile(&who)
            .await
            .unwrap();
        assert!(r.snapshot_rewritten);
        assert_eq!((r.added, r.removed), (0, 0));

        let acct = store.fetch_account(&who).await.unwrap().unwrap();
        assert_eq!(acct.snapshot, vec!["drake", "drake"]);
        assert_eq!(store.list_instances(&who).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn missing_account_is_a_per_account_failure() {
        let (store, clock, who) = seeded(&["potion"]).await;
        let ghost = Identity::new("ghost").unwrap();

        let batch = reconciler(&store, &clock, TrustDirection::Snapshot)
            .reconcile_all(&[ghost.clone(), who.clone()])
            .await
            .unwrap();

        assert_eq!(batch.accounts(), 2);
        assert_eq!(batch.failures(), 1);
        assert_eq!(batch.total_added(), 1);
        match &batch.results[0] {
            PerAccountResult::Failed(f) => {
                assert_eq!(f.identity, ghost);
                assert_eq!(f.code, "PARTIAL_RECONCILIATION_FAILURE");
            }
            other => panic!("expected failure first, got {other:?}"),
        }
    }
}
