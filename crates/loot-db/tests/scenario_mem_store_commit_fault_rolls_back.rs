//! A reward transaction that fails before commit leaves no trace: no ledger
//! entry, no balance change, no instances. A retry then applies once.
//!
//! Run: cargo test -p loot-db --features testkit --test scenario_mem_store_commit_fault_rolls_back

use chrono::{TimeZone, Utc};
use loot_db::{ClaimApply, LedgerInsert, MemStore, Store};
use loot_schemas::{ChestTier, Identity, RewardItem, RewardLimits, RewardPayload};

#[tokio::test]
async fn commit_fault_leaves_no_partial_state() {
    let store = MemStore::new();
    let who = Identity::new("player-rollback").unwrap();
    let now = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
    store.register_account(&who, now).await.unwrap();

    let reward = RewardPayload {
        currency_delta: 100,
        experience_delta: 10,
        items: vec![RewardItem::Chest {
            tier: ChestTier::Epic,
            quantity: 1,
        }],
    }
    .validate(&RewardLimits::default())
    .unwrap();
    let req = ClaimApply {
        identity: &who,
        claim_key: "boss:dragon:player-rollback:1",
        reward: &reward,
        applied_at: now,
    };

    store.inject_commit_fault();
    let err = store.apply_claim(req).await.unwrap_err();
    assert!(err.is_retryable(), "got {err}");

    assert!(store.find_claim(req.claim_key).await.unwrap().is_none());
    let acct = store.fetch_account(&who).await.unwrap().unwrap();
    assert_eq!((acct.balance, acct.experience), (0, 0));
    assert!(acct.snapshot.is_empty());
    assert!(store.list_instances(&who).await.unwrap().is_empty());

    // Retry re-enters at the ledger gate and finds nothing.
    let applied = store.apply_claim(req).await.unwrap();
    assert!(matches!(applied, LedgerInsert::Inserted(_)));
    let acct = store.fetch_account(&who).await.unwrap().unwrap();
    assert_eq!(acct.balance, 100);
    assert_eq!(acct.snapshot, vec!["chest:epic"]);
}
