//! A release and a revert intent competing for the same lock. Whichever the
//! seller's notary commits first wins; the other is refused.

mod common;

use std::time::Duration;

use crossnotary_common::{RequestStatus, SwapError};
use crossnotary_crypto::SignerPolicy;
use crossnotary_swap::relay::{extract_settlement_proof, SettlementRelay};
use crossnotary_swap::revert::RevertManager;
use crossnotary_swap::{LockPhase, LockStatus, SwapOutcome};

use common::{create_test_deployment, create_test_escrow, responder_outcome, PAINTING};

#[tokio::test(start_paused = true)]
async fn test_release_committed_first_wins() {
    let d = create_test_deployment().await;
    let e = create_test_escrow(&d).await;
    let relay = SettlementRelay::new(e.buyer.clone());

    let settlement = relay.finalize_buyer_leg(e.request_id).await.unwrap();
    let proof = extract_settlement_proof(e.buyer_lock.lock(), &settlement).unwrap();
    let release = relay
        .release_escrow(&e.buyer_lock, proof, settlement.id())
        .unwrap();

    tokio::time::advance(Duration::from_secs(95)).await;
    let revert = RevertManager::new(e.seller.clone());
    let intent = revert.register_revert_intent(&e.seller_lock).unwrap();

    // Once its leg is committed the buyer refuses to co-sign a revert.
    let err = RevertManager::new(e.buyer.clone())
        .authorize_revert_intent(e.request_id, &e.buyer_lock, &intent)
        .await
        .unwrap_err();
    assert!(matches!(err, SwapError::AuthorizationFailure(_)));

    // A signature taken before the leg committed still loses the race.
    let early_signature = e.buyer.sign(&intent);
    let committed = relay.commit_release(&e.buyer_lock, release).await.unwrap();
    assert!(revert
        .commit_intent(&e.seller_lock, intent, early_signature)
        .await
        .is_err());

    relay.record_release(e.buyer_lock, &committed).await.unwrap();
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.alice.party().key))
    );
}

#[tokio::test(start_paused = true)]
async fn test_intent_committed_first_blocks_release() {
    let d = create_test_deployment().await;
    let e = create_test_escrow(&d).await;
    let relay = SettlementRelay::new(e.buyer.clone());

    let settlement = relay.finalize_buyer_leg(e.request_id).await.unwrap();
    let proof = extract_settlement_proof(e.buyer_lock.lock(), &settlement).unwrap();
    let release = relay
        .release_escrow(&e.buyer_lock, proof, settlement.id())
        .unwrap();

    tokio::time::advance(Duration::from_secs(95)).await;
    let revert = RevertManager::new(e.seller.clone());
    let intent = revert.register_revert_intent(&e.seller_lock).unwrap();
    let signature = e.buyer.sign(&intent);
    let committed = revert
        .commit_intent(&e.seller_lock, intent, signature)
        .await
        .unwrap();

    assert!(relay.commit_release(&e.buyer_lock, release).await.is_err());

    let registered = revert.record_intent(e.seller_lock, &committed).unwrap();
    assert_eq!(registered.lock().phase, LockPhase::RevertIntentRegistered);
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::all_of([d.bob.party().key, d.alice.party().key]).unwrap())
    );
}

#[tokio::test(start_paused = true)]
async fn test_revert_intent_waits_for_the_deadline() {
    let d = create_test_deployment().await;
    let e = create_test_escrow(&d).await;
    let revert = RevertManager::new(e.seller.clone());

    let err = revert.register_revert_intent(&e.seller_lock).unwrap_err();
    assert!(matches!(err, SwapError::DeadlineViolation(_)));

    tokio::time::advance(Duration::from_secs(95)).await;
    let intent = revert.register_revert_intent(&e.seller_lock).unwrap();
    let signature = RevertManager::new(e.buyer.clone())
        .authorize_revert_intent(e.request_id, &e.buyer_lock, &intent)
        .await
        .unwrap();
    let committed = revert
        .commit_intent(&e.seller_lock, intent, signature)
        .await
        .unwrap();
    let registered = revert.record_intent(e.seller_lock, &committed).unwrap();

    let revert_tx = revert.build_revert(&registered).unwrap();
    let buyer_revert = RevertManager::new(e.buyer.clone());
    let buyer_registered = buyer_revert
        .resolve_intent(e.buyer_lock, &revert_tx)
        .await
        .unwrap();
    let signature = buyer_revert
        .authorize_revert(e.request_id, &buyer_registered, &revert_tx)
        .await
        .unwrap();
    let committed = revert
        .commit_revert(&registered, revert_tx, signature)
        .await
        .unwrap();
    revert.record_revert(registered, &committed).unwrap();

    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.bob.party().key))
    );
}

#[tokio::test(start_paused = true)]
async fn test_sweeper_reverts_a_lock_its_flow_left_open() {
    let d = create_test_deployment().await;
    let e = create_test_escrow(&d).await;
    let sweep_after = d.bob.node().config().sweep_after();

    // Not overdue yet: the deadline passed but the grace has not.
    tokio::time::advance(Duration::from_secs(95)).await;
    assert!(d.bob.recover_overdue_locks().await.is_empty());

    tokio::time::advance(sweep_after.to_std().unwrap()).await;
    // Only the seller re-drives its locks.
    assert!(d.alice.recover_overdue_locks().await.is_empty());
    let recovered = d.bob.recover_overdue_locks().await;
    assert_eq!(recovered.len(), 1);
    let (request_id, result) = &recovered[0];
    assert_eq!(*request_id, e.request_id);
    assert!(
        matches!(result, Ok(SwapOutcome::Reverted { .. })),
        "{:?}",
        result
    );

    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.bob.party().key))
    );
    let lock = d.bob.node().locks().for_request(&e.request_id).unwrap();
    assert_eq!(lock.status, LockStatus::Reverted);
    let buyer_side = responder_outcome(&d.alice, &e.request_id).await;
    assert!(matches!(buyer_side, SwapOutcome::Reverted { .. }));
    assert_eq!(
        d.alice.get_request(&e.request_id).await.unwrap().status,
        RequestStatus::Aborted
    );
    assert!(d.bob.recover_overdue_locks().await.is_empty());
}
