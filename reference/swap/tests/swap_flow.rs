mod common;

use std::time::Duration;

use crossnotary_common::{AssetRequest, RequestStatus, SwapError};
use crossnotary_crypto::SignerPolicy;
use crossnotary_protocol::SwapMessage;
use crossnotary_swap::negotiator::DraftNegotiator;
use crossnotary_swap::relay::SettlementRelay;
use crossnotary_swap::{ExecuteOptions, LockStatus, SwapConfig, SwapOutcome};
use futures::future::join_all;
use rust_decimal::Decimal;

use common::{
    create_approved_request, create_test_deployment, create_test_deployment_with,
    create_test_escrow, responder_outcome, seller_outcome, PAINTING,
};

#[tokio::test]
async fn test_happy_path_settles_both_legs() {
    let d = create_test_deployment().await;
    let request_id = create_approved_request(&d, 250).await;

    let outcome = d.alice.execute(request_id).await.unwrap();
    assert!(outcome.is_settled());
    let settlement_tx_id = outcome.settlement_tx_id().unwrap();

    assert_eq!(
        d.sandbox.balance(d.alice.party(), "USD").await.unwrap(),
        Decimal::from(750)
    );
    assert_eq!(
        d.sandbox.balance(d.bob.party(), "USD").await.unwrap(),
        Decimal::from(250)
    );
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.alice.party().key))
    );

    let buyer_view = d.alice.get_request(&request_id).await.unwrap();
    assert_eq!(buyer_view.status, RequestStatus::Approved);
    assert_eq!(buyer_view.settlement_tx_id, Some(settlement_tx_id));

    let seller_side = seller_outcome(&d.bob, &request_id).await;
    assert_eq!(seller_side.settlement_tx_id(), Some(settlement_tx_id));
    let seller_view = d.bob.get_request(&request_id).await.unwrap();
    assert_eq!(seller_view.settlement_tx_id, Some(settlement_tx_id));

    let lock = d.bob.node().locks().for_request(&request_id).unwrap();
    assert_eq!(lock.status, LockStatus::Released);
    assert_eq!(d.bob.node().locks().open_count(), 0);

    let buyer_metrics = d.alice.node().metrics().snapshot();
    assert_eq!(buyer_metrics.requests_created, 1);
    assert_eq!(buyer_metrics.swaps_settled, 1);
    assert_eq!(buyer_metrics.swaps_active, 0);
}

#[tokio::test(start_paused = true)]
async fn test_late_buyer_leg_reverts_escrow() {
    let d = create_test_deployment().await;
    let request_id = create_approved_request(&d, 250).await;

    let options = ExecuteOptions {
        settle_delay: Some(Duration::from_secs(100)),
    };
    let outcome = d.alice.execute_with(request_id, options).await.unwrap();
    assert!(
        matches!(outcome, SwapOutcome::Reverted { .. }),
        "expected a revert, got {:?}",
        outcome
    );

    assert_eq!(
        d.sandbox.balance(d.alice.party(), "USD").await.unwrap(),
        Decimal::from(1_000)
    );
    assert_eq!(
        d.sandbox.balance(d.bob.party(), "USD").await.unwrap(),
        Decimal::ZERO
    );
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.bob.party().key))
    );

    let buyer_view = d.alice.get_request(&request_id).await.unwrap();
    assert_eq!(buyer_view.status, RequestStatus::Aborted);
    assert!(buyer_view.reason.is_some());
    assert_eq!(buyer_view.settlement_tx_id, None);

    let seller_side = seller_outcome(&d.bob, &request_id).await;
    assert!(matches!(seller_side, SwapOutcome::Reverted { .. }));
    let lock = d.bob.node().locks().for_request(&request_id).unwrap();
    assert_eq!(lock.status, LockStatus::Reverted);
}

#[tokio::test]
async fn test_missing_holdings_abort_before_escrow() {
    let d = create_test_deployment().await;
    let request_id = create_approved_request(&d, 5_000).await;

    let outcome = d.alice.execute(request_id).await.unwrap();
    assert!(matches!(outcome, SwapOutcome::Aborted { .. }));
    assert!(outcome.reason().is_some());

    let buyer_view = d.alice.get_request(&request_id).await.unwrap();
    assert_eq!(buyer_view.status, RequestStatus::Aborted);
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.bob.party().key))
    );
    assert!(d.bob.node().locks().for_request(&request_id).is_none());
}

#[tokio::test]
async fn test_seller_without_the_asset_aborts_before_escrow() {
    let d = create_test_deployment().await;
    // Bob approves a swap for a painting nobody issued. The draft is fine but
    // the escrow cannot be built, so no value moves.
    let request_id = d
        .alice
        .create_request(
            &d.bob.party().name,
            AssetRequest::fungible("USD", Decimal::from(100)),
            AssetRequest::non_fungible("ART", "forgery"),
        )
        .await
        .unwrap();
    d.bob.approve(request_id, true, None).await.unwrap();

    let outcome = d.alice.execute(request_id).await.unwrap();
    assert!(matches!(outcome, SwapOutcome::Aborted { .. }));
    assert_eq!(
        d.sandbox.balance(d.alice.party(), "USD").await.unwrap(),
        Decimal::from(1_000)
    );

    let seller_side = seller_outcome(&d.bob, &request_id).await;
    assert!(matches!(seller_side, SwapOutcome::Aborted { .. }));
    let seller_view = d.bob.get_request(&request_id).await.unwrap();
    assert_eq!(seller_view.status, RequestStatus::Aborted);
}

#[tokio::test]
async fn test_denied_request_cannot_execute_or_be_reapproved() {
    let d = create_test_deployment().await;
    let request_id = d
        .alice
        .create_request(
            &d.bob.party().name,
            AssetRequest::fungible("USD", Decimal::from(10)),
            AssetRequest::non_fungible("ART", PAINTING),
        )
        .await
        .unwrap();
    assert_eq!(
        d.bob.get_request(&request_id).await.unwrap().status,
        RequestStatus::Requested
    );

    d.bob
        .approve(request_id, false, Some("price too low".to_string()))
        .await
        .unwrap();
    let buyer_view = d.alice.get_request(&request_id).await.unwrap();
    assert_eq!(buyer_view.status, RequestStatus::Denied);
    assert_eq!(buyer_view.reason.as_deref(), Some("price too low"));

    let err = d.bob.approve(request_id, true, None).await.unwrap_err();
    assert!(matches!(err, SwapError::InvalidTransition { .. }));

    let err = d.alice.execute(request_id).await.unwrap_err();
    assert!(matches!(err, SwapError::ValidationFailure(_)));
}

#[tokio::test]
async fn test_only_the_seller_approves_and_only_the_buyer_executes() {
    let d = create_test_deployment().await;
    let request_id = d
        .alice
        .create_request(
            &d.bob.party().name,
            AssetRequest::fungible("USD", Decimal::from(10)),
            AssetRequest::non_fungible("ART", PAINTING),
        )
        .await
        .unwrap();

    let err = d.alice.approve(request_id, true, None).await.unwrap_err();
    assert!(matches!(err, SwapError::AuthorizationFailure(_)));

    d.bob.approve(request_id, true, None).await.unwrap();
    let err = d.bob.execute(request_id).await.unwrap_err();
    assert!(matches!(err, SwapError::AuthorizationFailure(_)));
}

#[tokio::test]
async fn test_independent_requests_settle_in_parallel() {
    let d = create_test_deployment().await;
    d.sandbox
        .issue_fungible("GBP", Decimal::from(40), d.alice.party())
        .await
        .unwrap();
    d.sandbox
        .issue_fungible("USD", Decimal::from(50), d.bob.party())
        .await
        .unwrap();

    let painting = create_approved_request(&d, 300).await;
    let dollars = d
        .alice
        .create_request(
            &d.bob.party().name,
            AssetRequest::fungible("GBP", Decimal::from(40)),
            AssetRequest::fungible("USD", Decimal::from(50)),
        )
        .await
        .unwrap();
    d.bob.approve(dollars, true, None).await.unwrap();

    let outcomes = join_all([painting, dollars].map(|id| d.alice.execute(id))).await;
    for outcome in outcomes {
        assert!(outcome.unwrap().is_settled());
    }

    assert_eq!(
        d.sandbox.balance(d.alice.party(), "USD").await.unwrap(),
        Decimal::from(750)
    );
    assert_eq!(
        d.sandbox.balance(d.bob.party(), "GBP").await.unwrap(),
        Decimal::from(40)
    );
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.alice.party().key))
    );
}

#[tokio::test]
async fn test_execute_again_after_settlement_reports_the_same_settlement() {
    let d = create_test_deployment().await;
    let request_id = create_approved_request(&d, 250).await;

    let first = d.alice.execute(request_id).await.unwrap();
    seller_outcome(&d.bob, &request_id).await;
    let again = d.alice.execute(request_id).await.unwrap();
    assert_eq!(again, first);

    for service in [&d.alice, &d.bob] {
        let view = service.get_request(&request_id).await.unwrap();
        assert_eq!(view.status, RequestStatus::Approved);
        assert_eq!(view.settlement_tx_id, first.settlement_tx_id());
    }
    assert_eq!(
        d.sandbox.balance(d.alice.party(), "USD").await.unwrap(),
        Decimal::from(750)
    );
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.alice.party().key))
    );
}

#[tokio::test]
async fn test_seller_refuses_a_second_draft_once_escrowed() {
    let d = create_test_deployment().await;
    let request_id = create_approved_request(&d, 250).await;
    let outcome = d.alice.execute(request_id).await.unwrap();
    seller_outcome(&d.bob, &request_id).await;

    let proposal = DraftNegotiator::new(d.alice.node().clone())
        .propose_draft_transfer(request_id)
        .await
        .unwrap();
    let mut session = d
        .sandbox
        .network()
        .connect(d.alice.node(), d.bob.party(), request_id)
        .unwrap();
    session
        .send(SwapMessage::DraftProposal(proposal))
        .await
        .unwrap();
    let err = session.receive().await.unwrap_err();
    assert!(matches!(err, SwapError::CounterpartyAborted(_)), "{:?}", err);

    let seller_view = d.bob.get_request(&request_id).await.unwrap();
    assert_eq!(seller_view.status, RequestStatus::Approved);
    assert_eq!(seller_view.settlement_tx_id, outcome.settlement_tx_id());
    assert_eq!(d.bob.outcome(&request_id), Some(outcome));
}

#[tokio::test]
async fn test_execute_resumes_an_escrow_whose_flows_ended() {
    let d = create_test_deployment().await;
    let e = create_test_escrow(&d).await;
    // The buyer leg committed, then the buyer stopped before releasing.
    let settlement = SettlementRelay::new(e.buyer.clone())
        .finalize_buyer_leg(e.request_id)
        .await
        .unwrap();

    let outcome = d.alice.execute(e.request_id).await.unwrap();
    assert!(outcome.is_settled(), "{:?}", outcome);
    assert_eq!(outcome.settlement_tx_id(), Some(settlement.id()));
    assert_eq!(
        d.sandbox.holder_of("ART", PAINTING).await.unwrap(),
        Some(SignerPolicy::single(d.alice.party().key))
    );

    let seller_side = responder_outcome(&d.bob, &e.request_id).await;
    assert_eq!(seller_side.settlement_tx_id(), Some(settlement.id()));
    let seller_view = d.bob.get_request(&e.request_id).await.unwrap();
    assert_eq!(seller_view.settlement_tx_id, Some(settlement.id()));
    let lock = d.bob.node().locks().for_request(&e.request_id).unwrap();
    assert_eq!(lock.status, LockStatus::Released);
}

#[tokio::test(start_paused = true)]
async fn test_execute_refuses_to_start_a_leg_after_the_escrow_expired() {
    let d = create_test_deployment().await;
    let e = create_test_escrow(&d).await;
    tokio::time::advance(Duration::from_secs(95)).await;

    let err = d.alice.execute(e.request_id).await.unwrap_err();
    assert!(matches!(err, SwapError::DeadlineViolation(_)), "{:?}", err);
    assert_eq!(
        d.sandbox.balance(d.alice.party(), "USD").await.unwrap(),
        Decimal::from(1_000)
    );
    assert_eq!(
        d.alice.get_request(&e.request_id).await.unwrap().settlement_tx_id,
        None
    );
}

#[tokio::test(start_paused = true)]
async fn test_buyer_waits_out_a_long_escrow_for_the_revert() {
    // The escrow outlives the session timeout many times over.
    let config = SwapConfig {
        draft_window: chrono::Duration::seconds(600),
        ..SwapConfig::default()
    };
    let d = create_test_deployment_with(config).await;
    d.sandbox
        .issue_fungible("GBP", Decimal::from(10), d.bob.party())
        .await
        .unwrap();

    // The draft for `stale` is built from Alice's only USD state, which the
    // painting swap then spends. Its buyer leg can no longer commit.
    let stale = d
        .alice
        .create_request(
            &d.bob.party().name,
            AssetRequest::fungible("USD", Decimal::from(10)),
            AssetRequest::fungible("GBP", Decimal::from(10)),
        )
        .await
        .unwrap();
    d.bob.approve(stale, true, None).await.unwrap();
    DraftNegotiator::new(d.alice.node().clone())
        .propose_draft_transfer(stale)
        .await
        .unwrap();
    let painting = create_approved_request(&d, 250).await;
    assert!(d.alice.execute(painting).await.unwrap().is_settled());

    let outcome = d.alice.execute(stale).await.unwrap();
    assert!(
        matches!(outcome, SwapOutcome::Reverted { .. }),
        "expected a revert, got {:?}",
        outcome
    );
    assert_eq!(
        d.sandbox.balance(d.bob.party(), "GBP").await.unwrap(),
        Decimal::from(10)
    );
    assert_eq!(
        d.sandbox.balance(d.alice.party(), "GBP").await.unwrap(),
        Decimal::ZERO
    );
    assert_eq!(
        d.alice.get_request(&stale).await.unwrap().status,
        RequestStatus::Aborted
    );

    let seller_side = seller_outcome(&d.bob, &stale).await;
    assert!(matches!(seller_side, SwapOutcome::Reverted { .. }));
    let lock = d.bob.node().locks().for_request(&stale).unwrap();
    assert_eq!(lock.status, LockStatus::Reverted);
}
