//! Locked (reserved) instances are never chosen for removal. When the
//! unlocked surplus is not enough, the remainder is reported as shortfall.

use std::sync::Arc;
use std::time::Duration;

use loot_db::{MemStore, Store};
use loot_reconcile::{Reconciler, TrustDirection};
use loot_schemas::{Clock, Identity, ItemInstance, ManualClock};

const POTION: &str = "consumable:potion";

async fn setup(locked: usize, unlocked: usize) -> (Arc<MemStore>, ManualClock, Identity, Vec<uuid::Uuid>) {
    let clock = ManualClock::starting_now();
    let store = Arc::new(MemStore::new());
    let who = Identity::new("p1").unwrap();
    store.register_account(&who, clock.now()).await.unwrap();
    store
        .replace_snapshot(&who, &vec![POTION.to_string(); 3])
        .await
        .unwrap();

    let mut locked_ids = Vec::new();
    for n in 0..(locked + unlocked) {
        clock.advance_secs(1);
        let mut inst = ItemInstance::new(POTION, who.clone(), clock.now());
        if n < locked {
            inst.locked = true;
            locked_ids.push(inst.instance_id);
        }
        store.seed_instance(inst);
    }
    (store, clock, who, locked_ids)
}

fn reconciler(store: &Arc<MemStore>, clock: &ManualClock) -> Reconciler {
    Reconciler::new(
        store.clone(),
        Arc::new(clock.clone()),
        TrustDirection::Snapshot,
        4,
        Duration::from_secs(1),
    )
}

#[tokio::test]
async fn two_locked_of_five_removes_two_unlocked() {
    let (store, clock, who, locked) = setup(2, 3).await;

    let r = reconciler(&store, &clock).reconcile(&who).await.unwrap();
    assert_eq!(r.removed, 2);
    assert!(r.converged());

    let left = store.list_instances(&who).await.unwrap();
    assert_eq!(left.len(), 3);
    for id in locked {
        assert!(left.iter().any(|i| i.instance_id == id));
    }
}

#[tokio::test]
async fn shortfall_reported_when_surplus_is_locked() {
    // 5 potions, snapshot wants 3, 4 locked: only one can go
    let (store, clock, who, locked) = setup(4, 1).await;

    let r = reconciler(&store, &clock).reconcile(&who).await.unwrap();
    assert_eq!(r.removed, 1);
    assert_eq!(r.shortfall.get(POTION), Some(&1));
    assert!(!r.converged());

    let left = store.list_instances(&who).await.unwrap();
    assert_eq!(left.len(), 4);
    assert!(left.iter().all(|i| locked.contains(&i.instance_id)));
}
