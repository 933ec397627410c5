#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use crossnotary_common::{AssetRequest, RequestId};
use crossnotary_swap::escrow::EscrowManager;
use crossnotary_swap::lock_manager::EscrowedLock;
use crossnotary_swap::negotiator::DraftNegotiator;
use crossnotary_swap::{Sandbox, SwapConfig, SwapNode, SwapOutcome, SwapService};
use rust_decimal::Decimal;

pub const PAINTING: &str = "mona-lisa";

/// Log to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    if std::env::var("RUST_LOG").is_ok() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }
}

/// Alice holds 1000 USD on NotaryA, Bob holds the painting on NotaryB.
pub struct Deployment {
    pub sandbox: Sandbox,
    pub alice: SwapService,
    pub bob: SwapService,
}

pub async fn create_test_deployment() -> Deployment {
    create_test_deployment_with(SwapConfig::default()).await
}

pub async fn create_test_deployment_with(config: SwapConfig) -> Deployment {
    init_tracing();
    let sandbox = Sandbox::builder().config(config).build().unwrap();
    let alice = sandbox.add_party("Alice").unwrap();
    let bob = sandbox.add_party("Bob").unwrap();

    sandbox
        .issue_fungible("USD", Decimal::from(1_000), alice.party())
        .await
        .unwrap();
    sandbox
        .issue_unique("ART", PAINTING, bob.party())
        .await
        .unwrap();

    Deployment { sandbox, alice, bob }
}

/// Alice offers `price` USD for the painting and Bob approves.
pub async fn create_approved_request(deployment: &Deployment, price: i64) -> RequestId {
    let request_id = deployment
        .alice
        .create_request(
            &deployment.bob.party().name,
            AssetRequest::fungible("USD", Decimal::from(price)),
            AssetRequest::non_fungible("ART", PAINTING),
        )
        .await
        .unwrap();
    deployment
        .bob
        .approve(request_id, true, None)
        .await
        .unwrap();
    request_id
}

/// The seller flow runs on its own task; wait for it to finish.
pub async fn seller_outcome(seller: &SwapService, request_id: &RequestId) -> SwapOutcome {
    responder_outcome(seller, request_id).await
}

/// Wait for the flow a peer's session started on `service` to finish.
pub async fn responder_outcome(service: &SwapService, request_id: &RequestId) -> SwapOutcome {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            if let Some(outcome) = service.outcome(request_id) {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("responding flow did not finish")
}

pub struct Escrowed {
    pub buyer: Arc<SwapNode>,
    pub seller: Arc<SwapNode>,
    pub buyer_lock: EscrowedLock,
    pub seller_lock: EscrowedLock,
    pub request_id: RequestId,
}

/// Run the flows by hand up to a committed escrow. No flow is left running
/// on either side.
pub async fn create_test_escrow(d: &Deployment) -> Escrowed {
    let request_id = create_approved_request(d, 250).await;
    let buyer = d.alice.node().clone();
    let seller = d.bob.node().clone();

    let proposal = DraftNegotiator::new(buyer.clone())
        .propose_draft_transfer(request_id)
        .await
        .unwrap();
    let draft_id = DraftNegotiator::new(seller.clone())
        .accept_draft(&proposal)
        .await
        .unwrap();

    let seller_escrow = EscrowManager::new(seller.clone());
    let buyer_escrow = EscrowManager::new(buyer.clone());
    let seller_request = seller.request(&request_id).await.unwrap();
    let buyer_request = buyer.request(&request_id).await.unwrap();

    let offer = seller_escrow
        .offer_escrow(&seller_request, draft_id, &proposal.transfer)
        .await
        .unwrap();
    let proposed = buyer_escrow
        .check_escrow_proposal(&buyer_request, &offer)
        .unwrap();
    let signature = buyer_escrow.sign_escrow(&offer);
    let (committed, seller_lock) = seller_escrow
        .commit_escrow(&seller_request, offer, signature)
        .await
        .unwrap();
    let buyer_lock = buyer_escrow
        .verify_committed_escrow(proposed, &committed)
        .await
        .unwrap();

    Escrowed {
        buyer,
        seller,
        buyer_lock,
        seller_lock,
        request_id,
    }
}
