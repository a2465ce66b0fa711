use std::sync::atomic::Ordering;

use relayer::message::{BridgeMessage, ObservedEvent, Reset};

use crate::{DEST_CHAIN, MockChain, Network, NetworkBuilder, SOURCE_CHAIN};

fn reset(network: &Network, node: usize, event: &ObservedEvent) {
    network.nodes[node]
        .sender
        .broadcast(BridgeMessage::Reset(Reset {
            source: SOURCE_CHAIN,
            author: network.nodes[node].address(),
            transaction_hash: event.transaction_hash,
        }))
        .unwrap();
}

#[tokio::test(start_paused = true)]
async fn reset_allows_verifying_again() {
    let network = NetworkBuilder::new(1).build();
    let event = MockChain::event(0x31, 5, DEST_CHAIN, &[0xab]);
    network.chain.set_height(10);

    // The receipt is not available yet, so the request stays unsigned and the hash stays locked.
    network.request_from(0, &event);
    network.settle().await;
    network.request_from(0, &event);
    network.settle().await;
    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 1);
    assert_eq!(network.signatures(event.transaction_hash), 0);

    network.chain.record_receipt(&event);
    reset(&network, 0, &event);
    network.settle().await;
    assert!(!network.nodes[0].router.executed().contains(event.transaction_hash));

    network.request_from(0, &event);
    network
        .wait_until(|n| n.signatures(event.transaction_hash) == 1)
        .await;
    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn reset_abandons_a_pending_verification() {
    let network = NetworkBuilder::new(1).finality(10).build();
    let event = MockChain::event(0x32, 100, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    network.chain.set_height(95);

    network.request_from(0, &event);
    network.settle().await;
    reset(&network, 0, &event);
    network.settle().await;

    network.chain.set_height(111);
    network.settle().await;
    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 0);
    assert_eq!(network.signatures(event.transaction_hash), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_reopens_an_executed_hash() {
    let network = NetworkBuilder::new(1).transactors(vec![1]).build();
    network
        .chain
        .set_quorum(vec![network.nodes[0].address()], 1);
    network.chain.set_height(10);
    let event = MockChain::event(0x33, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);

    network.request_from(0, &event);
    network
        .wait_until(|n| n.executions(event.transaction_hash) == 1)
        .await;

    // Without a reset, executed hashes are ignored.
    network.request_from(0, &event);
    network.settle().await;
    assert_eq!(network.chain.submission_count(), 1);

    reset(&network, 0, &event);
    network.settle().await;
    network.request_from(0, &event);
    network
        .wait_until(|n| n.executions(event.transaction_hash) == 2)
        .await;
    assert_eq!(network.chain.submission_count(), 2);
}
