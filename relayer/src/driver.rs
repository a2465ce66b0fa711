//! The per-chain relay state machine.
//!
//! A [ChainDriver] owns everything that happens to a message whose source is its chain: reporting new
//! gateway requests, independently verifying the requests peers report, signing the valid ones, collecting
//! peer signatures until the gateway's own quorum check passes and finally submitting the execution from one
//! of its transactors.
//!
//! Per transaction hash the driver moves strictly forward through
//! `unseen -> locked -> signed -> enqueued -> executed`. The only way back is a reset, which forgets the hash
//! entirely. A failed submission resets the hash and feeds the message back into signature aggregation.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use alloy::primitives::{Address, TxHash, U256};
use anyhow::Result;
use dashmap::DashSet;
use opentelemetry::{KeyValue, global, metrics::Counter};
use tokio::{sync::watch, time};
use tracing::{debug, error, info, trace, warn};

use crate::{
    cfg::ChainConfig,
    client::{ChainClient, ExecutionCall, VerificationError},
    crypto::{SecretKey, penalty_digest, recover_digest_signer, recover_signer},
    ledger::{ExecutedSet, SignatureLedger},
    message::{
        BridgeMessage, ChainStatus, Execution, ObservedEvent, PenaltySigned, Request, Reset,
        Signed, Tattle,
    },
    p2p_node::MessageSender,
    transactor::{TransactorPool, TransactorQueue},
};

/// Fee passed to `messageProcess` while estimating gas, before the real fee is known. One ether.
const PLACEHOLDER_FEE: U256 = U256::from_limbs([1_000_000_000_000_000_000, 0, 0, 0]);

/// Upper bound on the number of blocks requested in a single log query.
const MAX_LOG_RANGE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stat {
    /// Requests broadcast.
    Brtx,
    /// Requests received and locked for verification.
    Brrx,
    /// Signatures broadcast.
    Sgtx,
    /// Signatures received.
    Sgrx,
    Exec,
    Fail,
    Tattle,
    PenaltySigned,
}

impl Stat {
    const ALL: [Stat; 8] = [
        Stat::Brtx,
        Stat::Brrx,
        Stat::Sgtx,
        Stat::Sgrx,
        Stat::Exec,
        Stat::Fail,
        Stat::Tattle,
        Stat::PenaltySigned,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Stat::Brtx => "brtx",
            Stat::Brrx => "brrx",
            Stat::Sgtx => "sgtx",
            Stat::Sgrx => "sgrx",
            Stat::Exec => "exec",
            Stat::Fail => "fail",
            Stat::Tattle => "tattle",
            Stat::PenaltySigned => "psrx",
        }
    }
}

/// Counters kept in memory for heartbeats and mirrored to OpenTelemetry.
pub struct DriverStats {
    chain_id: u64,
    counts: [AtomicU64; Stat::ALL.len()],
    metric: Counter<u64>,
}

impl DriverStats {
    fn new(chain_id: u64) -> Self {
        let metric = global::meter("relayer")
            .u64_counter("relayer.bridge.messages")
            .with_description("Bridge messages handled, by kind")
            .build();
        DriverStats {
            chain_id,
            counts: Default::default(),
            metric,
        }
    }

    fn bump(&self, stat: Stat) {
        self.counts[stat as usize].fetch_add(1, Ordering::Relaxed);
        self.metric.add(
            1,
            &[
                KeyValue::new("chain.id", self.chain_id as i64),
                KeyValue::new("bridge.kind", stat.name()),
            ],
        );
    }

    pub fn get(&self, stat: Stat) -> u64 {
        self.counts[stat as usize].load(Ordering::Relaxed)
    }
}

pub struct ChainDriver {
    chain_id: u64,
    name: String,
    client: Arc<dyn ChainClient>,
    key: SecretKey,
    finality: u64,
    poll_interval: Duration,
    gas_multiplier_percent: u64,
    height: watch::Sender<u64>,
    executed: Arc<ExecutedSet>,
    signatures: Arc<SignatureLedger>,
    transactors: TransactorPool,
    /// `(hash, accused)` pairs we have already published an accusation for.
    tattled: DashSet<(TxHash, Address)>,
    /// `(hash, accused)` pairs we have already confirmed an accusation for.
    confirmed: DashSet<(TxHash, Address)>,
    sender: MessageSender,
    stats: DriverStats,
}

impl ChainDriver {
    /// Builds a driver for `config.chain_id`. Returns the queues of its transactors, which must each be
    /// drained by [ChainDriver::run_transactor].
    pub fn new(
        config: &ChainConfig,
        client: Arc<dyn ChainClient>,
        key: SecretKey,
        executed: Arc<ExecutedSet>,
        signatures: Arc<SignatureLedger>,
        sender: MessageSender,
    ) -> (Arc<ChainDriver>, Vec<TransactorQueue>) {
        let (transactors, queues) = TransactorPool::new(client.transactors().len());
        let (height, _) = watch::channel(0);
        let driver = ChainDriver {
            chain_id: config.chain_id,
            name: config.name.clone(),
            client,
            key,
            finality: config.finality,
            poll_interval: config.poll_interval,
            gas_multiplier_percent: config.gas_multiplier_percent,
            height,
            executed,
            signatures,
            transactors,
            tattled: DashSet::new(),
            confirmed: DashSet::new(),
            sender,
            stats: DriverStats::new(config.chain_id),
        };
        (Arc::new(driver), queues)
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> &DriverStats {
        &self.stats
    }

    /// The latest block height observed on this chain.
    pub fn height(&self) -> u64 {
        *self.height.borrow()
    }

    /// Records a newly observed block height. Heights never move backwards.
    pub fn observe_height(&self, height: u64) {
        self.height.send_if_modified(|current| {
            if height > *current {
                *current = height;
                true
            } else {
                false
            }
        });
    }

    /// Reports a gateway request seen on this chain to every peer, ourselves included. Verification only
    /// happens when the request comes back to us through the router.
    pub fn on_source_event(&self, event: ObservedEvent) -> Result<()> {
        let hash = event.transaction_hash;
        self.sender.broadcast(BridgeMessage::Request(Request {
            source: self.chain_id,
            author: self.key.address(),
            data: event,
        }))?;
        self.stats.bump(Stat::Brtx);
        info!(chain_id = self.chain_id, %hash, "brtx");
        Ok(())
    }

    pub async fn process_message_request(&self, request: Request) -> Result<()> {
        let hash = request.data.transaction_hash;
        let Some(claim) = self.executed.claim(hash) else {
            trace!(chain_id = self.chain_id, %hash, "request already claimed");
            return Ok(());
        };
        self.stats.bump(Stat::Brrx);
        info!(chain_id = self.chain_id, %hash, author = %request.author, "brrx");

        if !self
            .wait_for_finality(request.data.block_number, || self.executed.holds(hash, claim))
            .await
        {
            info!(chain_id = self.chain_id, %hash, "claim released while waiting for finality");
            return Ok(());
        }

        let verified = match self.verify(&request.data).await {
            Ok(verified) => verified,
            Err(e) => {
                warn!(chain_id = self.chain_id, %hash, %e, "failed to fetch receipt, hash stays claimed until reset");
                return Ok(());
            }
        };
        match verified {
            Ok(()) => {
                let signature = self.key.sign_payload(&request.data.args.payload)?;
                self.sender.broadcast(BridgeMessage::Signed(Signed {
                    source: self.chain_id,
                    author: self.key.address(),
                    data: request.data,
                    signer: self.key.address(),
                    signature,
                    signers: vec![],
                    signatures: vec![],
                }))?;
                self.stats.bump(Stat::Sgtx);
                info!(chain_id = self.chain_id, %hash, "sgtx");
            }
            Err(e) if e.is_mismatch() => {
                warn!(chain_id = self.chain_id, %hash, author = %request.author, %e, "invalid request");
                self.tattle(request.author, request.data)?;
            }
            Err(e) => {
                warn!(chain_id = self.chain_id, %hash, %e, "unknown request");
            }
        }
        Ok(())
    }

    pub async fn process_message_signed(&self, signed: Signed) -> Result<()> {
        let hash = signed.data.transaction_hash;
        if self.executed.is_done(hash) {
            trace!(chain_id = self.chain_id, %hash, "signature for executed message");
            return Ok(());
        }
        self.stats.bump(Stat::Sgrx);
        debug!(chain_id = self.chain_id, %hash, signer = %signed.signer, "sgrx");

        if self.transactors.is_empty() {
            return Ok(());
        }

        match recover_signer(&signed.data.args.payload, &signed.signature) {
            Ok(recovered) if recovered == signed.signer => {}
            Ok(recovered) => {
                warn!(chain_id = self.chain_id, %hash, signer = %signed.signer, %recovered, "signature from wrong signer");
                return Ok(());
            }
            Err(e) => {
                warn!(chain_id = self.chain_id, %hash, signer = %signed.signer, %e, "malformed signature");
                return Ok(());
            }
        }

        let (signers, signatures) = self
            .signatures
            .record(hash, signed.signer, signed.signature.clone());
        let count = signers.len();

        let valid = self
            .client
            .is_message_valid(
                signed.data.args.payload.clone(),
                signers.clone(),
                signatures.clone(),
            )
            .await?;
        if !valid {
            debug!(chain_id = self.chain_id, %hash, count, "quorum not reached");
            return Ok(());
        }

        // Whoever moves the hash to done first is the only one to enqueue it.
        if !self.executed.mark_done(hash) {
            return Ok(());
        }
        let index = self.transactors.enqueue(Signed {
            signers,
            signatures,
            ..signed
        })?;
        info!(chain_id = self.chain_id, %hash, count, transactor = index, "queued for execution");
        Ok(())
    }

    pub fn process_message_reset(&self, reset: Reset) {
        let hash = reset.transaction_hash;
        let cleared = self.executed.reset(hash);
        info!(chain_id = self.chain_id, %hash, author = %reset.author, cleared, "RSET");
    }

    /// Submits one queued message from the given transactor. After a poll interval, a failed submission clears
    /// the done mark and hands the message back to signature aggregation, unless a peer has reported executing
    /// it meanwhile.
    pub async fn process_queue(&self, transactor: usize, message: Signed) -> Result<()> {
        let hash = message.data.transaction_hash;
        match self.submit(transactor, &message).await {
            Ok((exec_hash, gas_units, gas_price, transaction_fee)) => {
                self.sender.broadcast(BridgeMessage::Execution(Execution {
                    source: message.source,
                    author: self.key.address(),
                    data: message.data,
                    signer: self.key.address(),
                    signers: message.signers,
                    signatures: message.signatures,
                    exec_hash,
                    gas_units,
                    gas_price,
                    transaction_fee,
                }))?;
                self.stats.bump(Stat::Exec);
                info!(chain_id = self.chain_id, %hash, %exec_hash, transactor, %transaction_fee, "EXEC");
                Ok(())
            }
            Err(e) => {
                self.stats.bump(Stat::Fail);
                // Gives a peer's execution report the chance to arrive before we retry.
                time::sleep(self.poll_interval).await;
                if !self.executed.release(hash) {
                    warn!(chain_id = self.chain_id, %hash, transactor, %e, "execution failed, already executed by a peer");
                    return Ok(());
                }
                warn!(chain_id = self.chain_id, %hash, transactor, %e, "execution failed, requeueing");
                self.process_message_signed(message).await
            }
        }
    }

    async fn submit(&self, transactor: usize, message: &Signed) -> Result<(TxHash, u64, U256, U256)> {
        let mut call = ExecutionCall {
            fee: PLACEHOLDER_FEE,
            payload: message.data.args.payload.clone(),
            signers: message.signers.clone(),
            signatures: message.signatures.clone(),
        };
        let gas_price = self.client.gas_price().await?;
        let estimate = self.client.estimate_execution_gas(transactor, &call).await?;
        let gas_units = estimate.saturating_mul(self.gas_multiplier_percent) / 100;
        let transaction_fee = gas_price.saturating_mul(U256::from(gas_units));

        call.fee = transaction_fee;
        let exec_hash = self
            .client
            .submit_execution(transactor, call, gas_units)
            .await?;
        Ok((exec_hash, gas_units, gas_price, transaction_fee))
    }

    pub async fn process_penalty_tattle(&self, tattle: Tattle) -> Result<()> {
        let hash = tattle.data.transaction_hash;
        info!(chain_id = self.chain_id, %hash, accused = %tattle.accused, author = %tattle.author, "TATL");
        if !self.confirmed.insert((hash, tattle.accused)) {
            return Ok(());
        }

        self.wait_for_finality(tattle.data.block_number, || true).await;
        match self.verify(&tattle.data).await? {
            Err(e) if e.is_mismatch() => {
                let signature = self
                    .key
                    .sign_digest(penalty_digest(tattle.accused, hash))?;
                self.sender
                    .broadcast(BridgeMessage::PenaltySigned(PenaltySigned {
                        source: self.chain_id,
                        author: self.key.address(),
                        accused: tattle.accused,
                        data: tattle.data,
                        signer: self.key.address(),
                        signature,
                    }))?;
                info!(chain_id = self.chain_id, %hash, accused = %tattle.accused, "penalty confirmed");
            }
            result => {
                debug!(chain_id = self.chain_id, %hash, ?result, "accusation not confirmed");
            }
        }
        Ok(())
    }

    pub fn process_penalty_signed(&self, signed: PenaltySigned) {
        let hash = signed.data.transaction_hash;
        match recover_digest_signer(penalty_digest(signed.accused, hash), &signed.signature) {
            Ok(recovered) if recovered == signed.signer => {
                self.stats.bump(Stat::PenaltySigned);
                info!(chain_id = self.chain_id, %hash, accused = %signed.accused, signer = %signed.signer, "PSIG");
            }
            Ok(_) | Err(_) => {
                warn!(chain_id = self.chain_id, %hash, signer = %signed.signer, "invalid penalty signature");
            }
        }
    }

    /// Drains one transactor's queue until the pool is dropped.
    pub async fn run_transactor(self: Arc<Self>, mut queue: TransactorQueue) {
        while let Some(message) = queue.recv().await {
            if let Err(e) = self.process_queue(queue.index, message).await {
                error!(chain_id = self.chain_id, transactor = queue.index, %e, "failed to process queued message");
            }
        }
    }

    /// Feeds the chain's block height into the driver forever.
    pub async fn watch_height(self: Arc<Self>) {
        let mut interval = time::interval(self.poll_interval);
        loop {
            interval.tick().await;
            match self.client.block_number().await {
                Ok(height) => self.observe_height(height),
                Err(e) => warn!(chain_id = self.chain_id, %e, "failed to fetch block number"),
            }
        }
    }

    /// Polls the gateway for new requests and reports each one, starting at `start_block` or the current
    /// head. The cursor only advances past ranges that were fetched successfully.
    pub async fn watch_events(self: Arc<Self>, start_block: Option<u64>) {
        let mut interval = time::interval(self.poll_interval);
        let mut next = start_block;
        loop {
            interval.tick().await;
            let head = match self.client.block_number().await {
                Ok(head) => head,
                Err(e) => {
                    warn!(chain_id = self.chain_id, %e, "failed to fetch block number");
                    continue;
                }
            };
            self.observe_height(head);
            let from = *next.get_or_insert(head);
            if head < from {
                continue;
            }
            let to = head.min(from.saturating_add(MAX_LOG_RANGE - 1));

            match self.client.request_logs(from, to).await {
                Ok(events) => {
                    for event in events {
                        if let Err(e) = self.on_source_event(event) {
                            error!(chain_id = self.chain_id, %e, "failed to broadcast request");
                        }
                    }
                    next = Some(to + 1);
                }
                Err(e) => warn!(chain_id = self.chain_id, from, to, %e, "failed to fetch request logs"),
            }
        }
    }

    pub async fn status(&self) -> ChainStatus {
        ChainStatus {
            id: self.chain_id,
            name: self.name.clone(),
            key: self.key.address(),
            block: self.height(),
            txqueue: self.transactors.queued(),
            brtx: self.stats.get(Stat::Brtx),
            brrx: self.stats.get(Stat::Brrx),
            sgtx: self.stats.get(Stat::Sgtx),
            sgrx: self.stats.get(Stat::Sgrx),
            exec: self.stats.get(Stat::Exec),
            fail: self.stats.get(Stat::Fail),
            gas_price: self.client.gas_price().await.ok(),
        }
    }

    /// Waits until the observed height passes `block_number + finality`. Returns `false` without waiting
    /// further as soon as `still_wanted` does.
    async fn wait_for_finality(&self, block_number: u64, still_wanted: impl Fn() -> bool) -> bool {
        let target = block_number.saturating_add(self.finality);
        let mut height = self.height.subscribe();
        loop {
            if !still_wanted() {
                return false;
            }
            if *height.borrow_and_update() > target {
                return true;
            }
            // Wake up on a new height, or periodically to notice a reset.
            let _ = time::timeout(self.poll_interval, height.changed()).await;
        }
    }

    /// Re-derives `event` from this chain's own receipt for the transaction.
    async fn verify(&self, event: &ObservedEvent) -> Result<Result<(), VerificationError>> {
        let Some(receipt) = self
            .client
            .transaction_receipt(event.transaction_hash)
            .await?
        else {
            return Ok(Err(VerificationError::ReceiptNotFound));
        };
        let requests: Vec<_> = receipt
            .logs
            .iter()
            .filter_map(|log| self.client.decode_request(log))
            .collect();
        Ok(receipt.verify(event, &requests))
    }

    fn tattle(&self, accused: Address, event: ObservedEvent) -> Result<()> {
        let hash = event.transaction_hash;
        if !self.tattled.insert((hash, accused)) {
            return Ok(());
        }
        self.sender.broadcast(BridgeMessage::PenaltyTattle(Tattle {
            source: self.chain_id,
            author: self.key.address(),
            accused,
            data: event,
        }))?;
        self.stats.bump(Stat::Tattle);
        info!(chain_id = self.chain_id, %hash, %accused, "tattle");
        Ok(())
    }
}
