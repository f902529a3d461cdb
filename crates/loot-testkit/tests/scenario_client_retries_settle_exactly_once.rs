//! Scenario: claim responses are lost on the way back to the client.
//!
//! The client retries with a fresh nonce and the same claim key; the server
//! ledger turns every retry into a replay of the first result.

use std::sync::Arc;

use loot_config::{GatewaySettings, LootConfig};
use loot_db::MemStore;
use loot_gateway::{
    ClaimClient, MemGuardStore, Mutation, MutationGateway, MutationResult, SkipReason, Submission,
    TransportError,
};
use loot_schemas::ClaimOutcome;
use loot_testkit::{card_reward, Harness, LocalTransport, SESSION};

#[tokio::test(start_paused = true)]
async fn lost_responses_are_retried_into_a_single_grant() -> anyhow::Result<()> {
    let h = Harness::new(Arc::new(MemStore::new()), LootConfig::default());
    let who = h.register("p1").await?;
    let transport = Arc::new(LocalTransport::new(&h));
    transport.lose_next_claim_responses(2);

    let client = ClaimClient::new(transport.clone(), GatewaySettings::default().retry_backoff());
    let reward = card_reward("drake", 1, 75);
    let out = client.claim(&who, SESSION, "boss-1", &reward).await;

    match out {
        Ok(ClaimOutcome::Applied { duplicate, result }) => {
            assert!(duplicate, "the third attempt replays the first grant");
            assert_eq!(result.balance_after, 75);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(transport.claims_seen(), 3);
    assert_eq!(h.account(&who).await?.balance, 75);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn retries_stop_after_the_backoff_schedule() -> anyhow::Result<()> {
    let h = Harness::new(Arc::new(MemStore::new()), LootConfig::default());
    let who = h.register("p1").await?;
    let transport = Arc::new(LocalTransport::new(&h));
    transport.lose_next_claim_responses(10);

    let client = ClaimClient::new(transport.clone(), GatewaySettings::default().retry_backoff());
    let out = client
        .claim(&who, SESSION, "boss-2", &card_reward("drake", 1, 5))
        .await;

    assert_eq!(out, Err(TransportError::Timeout));
    assert_eq!(transport.claims_seen(), 4);
    // The grant happened on the first attempt even though no response arrived.
    assert_eq!(h.account(&who).await?.balance, 5);
    Ok(())
}

#[tokio::test]
async fn gateway_suppresses_a_double_click() -> anyhow::Result<()> {
    let h = Harness::new(Arc::new(MemStore::new()), LootConfig::default());
    let who = h.register("p1").await?;
    let transport = Arc::new(LocalTransport::new(&h));

    let gateway = MutationGateway::new(
        transport.clone(),
        Arc::new(MemGuardStore::new()),
        Arc::new(h.clock.clone()),
        &GatewaySettings::default(),
    );

    let m = Mutation::Claim {
        claim_key: "chest-open-3".to_string(),
        session_ref: SESSION.to_string(),
        reward: card_reward("drake", 1, 20),
    };

    let first = gateway.submit(&who, &m).await;
    assert!(matches!(
        first,
        Submission::Dispatched(Ok(MutationResult::Claim(ClaimOutcome::Applied { duplicate: false, .. })))
    ));
    assert_eq!(
        gateway.submit(&who, &m).await.skip_reason(),
        Some(SkipReason::RecentDuplicate)
    );

    h.clock.advance_secs(6);
    let again = gateway.submit(&who, &m).await;
    assert!(matches!(
        again,
        Submission::Dispatched(Ok(MutationResult::Claim(ClaimOutcome::Applied { duplicate: true, .. })))
    ));
    assert_eq!(h.account(&who).await?.balance, 20);
    Ok(())
}
