use std::{sync::atomic::Ordering, time::Duration};

use alloy::primitives::{B256, U256};
use relayer::{
    driver::Stat,
    message::{BridgeMessage, Execution, Signed},
};
use tokio::time::Instant;

use crate::{
    DEST_CHAIN, GAS_ESTIMATE, GAS_PRICE, MockChain, NetworkBuilder, SOURCE_CHAIN, node_key,
    transactor_key,
};

#[tokio::test(start_paused = true)]
async fn observed_request_is_signed_and_executed_once() {
    let network = NetworkBuilder::new(3)
        .transactors(vec![1, 0, 0])
        .finality(10)
        .build();
    let validators = network.nodes.iter().map(|n| n.address()).collect();
    network.chain.set_quorum(validators, 3);
    network.chain.set_height(95);

    let event = MockChain::event(0x11, 100, DEST_CHAIN, b"transfer");
    network.chain.emit(&event);
    network.settle().await;
    assert_eq!(network.signatures(event.transaction_hash), 0);

    network.chain.set_height(111);
    network
        .wait_until(|n| n.executions(event.transaction_hash) == 1)
        .await;
    network.settle().await;

    assert_eq!(network.signatures(event.transaction_hash), 3);
    assert_eq!(network.executions(event.transaction_hash), 1);
    assert_eq!(network.chain.submission_count(), 1);
    for node in &network.nodes {
        assert_eq!(node.driver().stats().get(Stat::Brtx), 1);
        assert_eq!(node.driver().stats().get(Stat::Sgtx), 1);
        assert!(node.router.executed().is_done(event.transaction_hash));
    }

    let execution = network
        .published()
        .into_iter()
        .find_map(|m| match m {
            BridgeMessage::Execution(e) => Some(e),
            _ => None,
        })
        .unwrap();
    assert_eq!(execution.author, network.nodes[0].address());
    assert_eq!(execution.source, SOURCE_CHAIN);
    assert_eq!(execution.signers.len(), 3);
    assert_eq!(execution.gas_units, GAS_ESTIMATE * 110 / 100);
    assert_eq!(execution.gas_price, U256::from(GAS_PRICE));
    assert_eq!(
        execution.transaction_fee,
        U256::from(GAS_PRICE) * U256::from(GAS_ESTIMATE * 110 / 100)
    );

    let submissions = network.chain.submissions.lock();
    let (transactor, call, gas_limit) = &submissions[0];
    assert_eq!(*transactor, transactor_key(0, 0).address());
    assert_eq!(*gas_limit, execution.gas_units);
    assert_eq!(call.fee, execution.transaction_fee);
    assert_eq!(call.payload.as_ref(), b"transfer");
}

#[tokio::test(start_paused = true)]
async fn execution_waits_for_the_gateway_quorum() {
    let network = NetworkBuilder::new(2).transactors(vec![1, 0]).build();
    let outsider = node_key(5);
    let validators = vec![
        network.nodes[0].address(),
        network.nodes[1].address(),
        outsider.address(),
    ];
    network.chain.set_quorum(validators, 3);
    network.chain.set_height(10);

    let event = MockChain::event(0x12, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    network.request_from(1, &event);
    network
        .wait_until(|n| n.signatures(event.transaction_hash) == 2)
        .await;
    network.settle().await;
    assert_eq!(network.executions(event.transaction_hash), 0);
    assert_eq!(network.chain.submission_count(), 0);

    // A third validator that runs no relay node of its own.
    network.nodes[1]
        .sender
        .broadcast(BridgeMessage::Signed(Signed {
            source: SOURCE_CHAIN,
            author: outsider.address(),
            data: event.clone(),
            signer: outsider.address(),
            signature: outsider.sign_payload(&[0xab]).unwrap(),
            signers: vec![],
            signatures: vec![],
        }))
        .unwrap();
    network
        .wait_until(|n| n.executions(event.transaction_hash) == 1)
        .await;

    let submissions = network.chain.submissions.lock();
    let signers = &submissions[0].1.signers;
    assert_eq!(signers.len(), 3);
    assert!(signers.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test(start_paused = true)]
async fn failed_submission_is_retried() {
    let network = NetworkBuilder::new(1).transactors(vec![1]).build();
    network
        .chain
        .set_quorum(vec![network.nodes[0].address()], 1);
    network.chain.set_height(10);
    network.chain.failing_submissions.store(1, Ordering::SeqCst);

    let event = MockChain::event(0x13, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    let start = Instant::now();
    network.request_from(0, &event);
    network
        .wait_until(|n| n.executions(event.transaction_hash) == 1)
        .await;
    // The retry waits out one poll interval.
    assert!(start.elapsed() >= Duration::from_secs(1));
    network.settle().await;

    let stats = network.nodes[0].driver().stats();
    assert_eq!(stats.get(Stat::Fail), 1);
    assert_eq!(stats.get(Stat::Exec), 1);
    assert_eq!(network.chain.failed_submissions.load(Ordering::SeqCst), 1);
    assert_eq!(network.chain.submission_count(), 1);
    assert_eq!(network.executions(event.transaction_hash), 1);
}

#[tokio::test(start_paused = true)]
async fn every_node_executes_at_most_once() {
    let network = NetworkBuilder::new(3).transactors(vec![1, 1, 1]).build();
    let validators = network.nodes.iter().map(|n| n.address()).collect();
    network.chain.set_quorum(validators, 2);
    network.chain.set_height(10);

    let event = MockChain::event(0x14, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);
    network.request_from(2, &event);
    network
        .wait_until(|n| n.executions(event.transaction_hash) >= 1)
        .await;
    network.settle().await;

    for node in &network.nodes {
        let author = node.address();
        assert!(
            network.count(|m| matches!(m, BridgeMessage::Execution(e) if e.author == author)) <= 1
        );
        assert!(node.driver().stats().get(Stat::Exec) <= 1);
    }
    assert_eq!(
        network.chain.submission_count(),
        network.executions(event.transaction_hash)
    );
}

#[tokio::test(start_paused = true)]
async fn transactors_take_turns() {
    let network = NetworkBuilder::new(1).transactors(vec![3]).build();
    network
        .chain
        .set_quorum(vec![network.nodes[0].address()], 1);
    network.chain.set_height(10);

    for (round, hash) in [0x21, 0x22, 0x23, 0x24].into_iter().enumerate() {
        let event = MockChain::event(hash, 5, DEST_CHAIN, &[hash]);
        network.chain.record_receipt(&event);
        network.request_from(0, &event);
        network
            .wait_until(|n| n.chain.submission_count() == round + 1)
            .await;
    }

    let used: Vec<_> = network
        .chain
        .submissions
        .lock()
        .iter()
        .map(|(transactor, _, _)| *transactor)
        .collect();
    assert_eq!(
        used,
        vec![
            transactor_key(0, 0).address(),
            transactor_key(0, 1).address(),
            transactor_key(0, 2).address(),
            transactor_key(0, 0).address(),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn execution_reported_by_a_peer_ends_the_transfer() {
    let network = NetworkBuilder::new(2).transactors(vec![1, 1]).build();
    network
        .chain
        .set_quorum(network.nodes.iter().map(|n| n.address()).collect(), 1);
    network.chain.set_height(10);
    let event = MockChain::event(0x15, 5, DEST_CHAIN, &[0xab]);
    network.chain.record_receipt(&event);

    // Some relay outside this network already delivered the message.
    let outsider = node_key(6).address();
    network.nodes[0]
        .sender
        .broadcast(BridgeMessage::Execution(Execution {
            source: SOURCE_CHAIN,
            author: outsider,
            data: event.clone(),
            signer: outsider,
            signers: vec![outsider],
            signatures: vec![],
            exec_hash: B256::repeat_byte(0xee),
            gas_units: GAS_ESTIMATE,
            gas_price: U256::from(GAS_PRICE),
            transaction_fee: U256::from(GAS_PRICE) * U256::from(GAS_ESTIMATE),
        }))
        .unwrap();
    network.settle().await;

    network.request_from(1, &event);
    network.nodes[1]
        .sender
        .broadcast(BridgeMessage::Signed(Signed {
            source: SOURCE_CHAIN,
            author: network.nodes[1].address(),
            data: event.clone(),
            signer: network.nodes[1].address(),
            signature: network.nodes[1].key.sign_payload(&[0xab]).unwrap(),
            signers: vec![],
            signatures: vec![],
        }))
        .unwrap();
    network.settle().await;

    assert_eq!(network.chain.receipt_queries.load(Ordering::SeqCst), 0);
    assert_eq!(network.chain.submission_count(), 0);
    assert_eq!(network.executions(event.transaction_hash), 1);
    for node in &network.nodes {
        assert!(node.router.executed().is_done(event.transaction_hash));
        assert_eq!(node.driver().stats().get(Stat::Sgrx), 0);
    }
}
