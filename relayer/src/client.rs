//! The capabilities a chain driver needs from a blockchain.

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use anyhow::Result;
use async_trait::async_trait;
use thiserror::Error;

use crate::message::{MessageRequest, ObservedEvent};

/// A log as it appears in a transaction receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
}

/// The parts of a transaction receipt that verification compares against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Receipt {
    pub block_hash: B256,
    pub block_number: u64,
    pub transaction_hash: TxHash,
    pub logs: Vec<ReceiptLog>,
}

/// Arguments to the gateway's `isMessageValid` and `messageProcess` calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionCall {
    pub fee: U256,
    pub payload: Bytes,
    pub signers: Vec<Address>,
    pub signatures: Vec<Bytes>,
}

/// Ways in which a gossiped event can fail to match the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VerificationError {
    #[error("no receipt for transaction")]
    ReceiptNotFound,
    #[error("receipt contains no gateway request")]
    NoMatchingLog,
    #[error("block hash mismatch: chain has {chain}, claim has {claimed}")]
    BlockHashMismatch { chain: B256, claimed: B256 },
    #[error("block number mismatch: chain has {chain}, claim has {claimed}")]
    BlockNumberMismatch { chain: u64, claimed: u64 },
    #[error("transaction hash mismatch: chain has {chain}, claim has {claimed}")]
    TransactionHashMismatch { chain: TxHash, claimed: TxHash },
    #[error("event argument `{0}` does not match")]
    ArgumentMismatch(&'static str),
}

impl VerificationError {
    /// Whether the error proves the claim false, as opposed to the claim being unverifiable.
    pub fn is_mismatch(&self) -> bool {
        !matches!(
            self,
            VerificationError::ReceiptNotFound | VerificationError::NoMatchingLog
        )
    }
}

impl Receipt {
    /// Checks `event` against this receipt. `requests` holds the gateway requests decoded from the
    /// receipt's logs. The claim holds if any one of them matches every argument.
    pub fn verify(
        &self,
        event: &ObservedEvent,
        requests: &[MessageRequest],
    ) -> Result<(), VerificationError> {
        if requests.is_empty() {
            return Err(VerificationError::NoMatchingLog);
        }
        if self.block_hash != event.block_hash {
            return Err(VerificationError::BlockHashMismatch {
                chain: self.block_hash,
                claimed: event.block_hash,
            });
        }
        if self.block_number != event.block_number {
            return Err(VerificationError::BlockNumberMismatch {
                chain: self.block_number,
                claimed: event.block_number,
            });
        }
        if self.transaction_hash != event.transaction_hash {
            return Err(VerificationError::TransactionHashMismatch {
                chain: self.transaction_hash,
                claimed: event.transaction_hash,
            });
        }

        let mut first_error = None;
        for request in requests {
            match compare_args(request, &event.args) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        Err(first_error.unwrap_or(VerificationError::NoMatchingLog))
    }
}

fn compare_args(chain: &MessageRequest, claimed: &MessageRequest) -> Result<(), VerificationError> {
    if chain.tx_id != claimed.tx_id {
        return Err(VerificationError::ArgumentMismatch("txId"));
    }
    if chain.dest_chain_id != claimed.dest_chain_id {
        return Err(VerificationError::ArgumentMismatch("destChainId"));
    }
    if chain.payload != claimed.payload {
        return Err(VerificationError::ArgumentMismatch("data"));
    }
    Ok(())
}

/// RPC access to a single chain and its gateway contract.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    async fn block_number(&self) -> Result<u64>;

    async fn transaction_receipt(&self, hash: TxHash) -> Result<Option<Receipt>>;

    /// Decodes a `MessageRequest` emitted by the gateway. Returns `None` for logs from any other address or
    /// of any other event.
    fn decode_request(&self, log: &ReceiptLog) -> Option<MessageRequest>;

    /// Every `MessageRequest` emitted by the gateway in the inclusive block range.
    async fn request_logs(&self, from: u64, to: u64) -> Result<Vec<ObservedEvent>>;

    /// The gateway's own quorum check.
    async fn is_message_valid(
        &self,
        payload: Bytes,
        signers: Vec<Address>,
        signatures: Vec<Bytes>,
    ) -> Result<bool>;

    async fn gas_price(&self) -> Result<U256>;

    async fn estimate_execution_gas(&self, transactor: usize, call: &ExecutionCall) -> Result<u64>;

    /// Signs `call` with the given transactor's key and sends it, returning the transaction hash.
    async fn submit_execution(
        &self,
        transactor: usize,
        call: ExecutionCall,
        gas_limit: u64,
    ) -> Result<TxHash>;

    /// Addresses of the configured transactors, in index order.
    fn transactors(&self) -> Vec<Address>;
}
