use std::sync::atomic::Ordering;

use alloy::primitives::{Address, U256};
use relayer::{
    driver::Stat,
    message::{BridgeMessage, Signed},
};

use crate::{DEST_CHAIN, MockChain, NetworkBuilder, SOURCE_CHAIN, node_key};

#[tokio::test(start_paused = true)]
async fn signing_waits_for_finality() {
    let network = NetworkBuilder::new(2).finality(10).build();
    let event = MockChain::event(1, 100, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    network.chain.set_height(95);

    network.request_from(0, &event);
    network.settle().await;
    assert_eq!(network.signatures(event.transaction_hash), 0);
    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 0);

    // `blockNumber + finality` itself is not enough.
    network.chain.set_height(110);
    network.settle().await;
    assert_eq!(network.signatures(event.transaction_hash), 0);
    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 0);

    network.chain.set_height(111);
    network
        .wait_until(|n| n.signatures(event.transaction_hash) == 2)
        .await;
    for node in &network.nodes {
        assert_eq!(node.driver().height(), 111);
    }
}

#[tokio::test(start_paused = true)]
async fn repeated_requests_are_verified_once() {
    let network = NetworkBuilder::new(3).build();
    let event = MockChain::event(2, 5, DEST_CHAIN, &[1, 2, 3]);
    network.chain.record_receipt(&event);
    network.chain.set_height(10);

    for node in [0, 1, 2, 0, 1] {
        network.request_from(node, &event);
    }
    network
        .wait_until(|n| n.signatures(event.transaction_hash) >= 3)
        .await;
    network.settle().await;

    for node in &network.nodes {
        assert_eq!(network.signed_by(node.address(), event.transaction_hash), 1);
        assert_eq!(node.driver().stats().get(Stat::Brrx), 1);
        assert_eq!(node.driver().stats().get(Stat::Sgtx), 1);
    }
    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn signatures_are_over_the_payload_digest() {
    let network = NetworkBuilder::new(1).build();
    let event = MockChain::event(3, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    network.chain.set_height(10);

    network.request_from(0, &event);
    network.wait_until(|n| n.signatures(event.transaction_hash) == 1).await;

    let signed = network
        .published()
        .into_iter()
        .find_map(|m| match m {
            BridgeMessage::Signed(s) => Some(s),
            _ => None,
        })
        .unwrap();
    assert_eq!(signed.source, SOURCE_CHAIN);
    assert_eq!(signed.signer, node_key(0).address());
    assert_eq!(
        relayer::crypto::recover_signer(&[0xab], &signed.signature).unwrap(),
        signed.signer
    );
}

#[tokio::test(start_paused = true)]
async fn destination_mismatch_is_rejected_and_reported() {
    let network = NetworkBuilder::new(3).build();
    let on_chain = MockChain::event(4, 5, 3, &[0xab]);
    network.chain.record_receipt(&on_chain);
    network.chain.set_height(10);

    // Node 0 claims the transfer goes to a different chain than the gateway logged.
    let mut claimed = on_chain.clone();
    claimed.args.dest_chain_id = U256::from(DEST_CHAIN);
    network.request_from(0, &claimed);

    let accused = network.nodes[0].address();
    network
        .wait_until(|n| {
            n.count(|m| matches!(m, BridgeMessage::PenaltySigned(p) if p.accused == accused)) == 3
        })
        .await;

    assert_eq!(network.signatures(claimed.transaction_hash), 0);
    for node in &network.nodes {
        assert_eq!(
            network.count(|m| matches!(m, BridgeMessage::PenaltyTattle(t) if t.author == node.address() && t.accused == accused)),
            1
        );
        assert_eq!(node.driver().stats().get(Stat::PenaltySigned), 3);
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_transaction_is_not_signed() {
    let network = NetworkBuilder::new(2).build();
    let event = MockChain::event(5, 5, DEST_CHAIN, &[0xab]);
    network.chain.set_height(10);

    network.request_from(0, &event);
    network
        .wait_until(|n| n.chain.receipt_queries.load(Ordering::SeqCst) == 2)
        .await;
    network.settle().await;

    assert_eq!(network.signatures(event.transaction_hash), 0);
    assert_eq!(
        network.count(|m| matches!(m, BridgeMessage::PenaltyTattle(_))),
        0
    );
}

#[tokio::test(start_paused = true)]
async fn logs_from_other_contracts_are_ignored() {
    let network = NetworkBuilder::new(1).build();
    let event = MockChain::event(6, 5, DEST_CHAIN, &[0xab]);
    network.chain.set_height(10);

    // The same event, emitted by some other contract.
    network
        .chain
        .record_receipt_from(&event, Address::repeat_byte(0xbb));

    network.request_from(0, &event);
    network
        .wait_until(|n| n.chain.receipt_queries.load(Ordering::SeqCst) == 1)
        .await;
    network.settle().await;
    assert_eq!(network.signatures(event.transaction_hash), 0);
}

#[tokio::test(start_paused = true)]
async fn forged_signatures_are_not_collected() {
    let network = NetworkBuilder::new(1).transactors(vec![1]).build();
    let event = MockChain::event(7, 5, DEST_CHAIN, &[0xab]);
    let validator = node_key(5).address();
    network.chain.set_quorum(vec![validator], 1);

    // Signed by node 0 but claiming to come from the validator.
    network.nodes[0]
        .sender
        .broadcast(BridgeMessage::Signed(Signed {
            source: SOURCE_CHAIN,
            author: network.nodes[0].address(),
            data: event.clone(),
            signer: validator,
            signature: network.nodes[0].key.sign_payload(&[0xab]).unwrap(),
            signers: vec![],
            signatures: vec![],
        }))
        .unwrap();
    network.settle().await;

    assert_eq!(network.nodes[0].driver().stats().get(Stat::Sgrx), 1);
    assert_eq!(network.executions(event.transaction_hash), 0);
    assert_eq!(network.chain.submission_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn receipt_errors_keep_the_hash_claimed() {
    let network = NetworkBuilder::new(1).build();
    let event = MockChain::event(8, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    network.chain.set_height(10);
    network.chain.failing_receipt_queries.store(1, Ordering::SeqCst);

    network.request_from(0, &event);
    network.settle().await;
    network.request_from(0, &event);
    network.settle().await;

    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 1);
    assert_eq!(network.signatures(event.transaction_hash), 0);
    assert!(network.nodes[0].router.executed().contains(event.transaction_hash));
}
