//! The messages gossiped between relay nodes.
//!
//! Every message kind travels on its own gossip topic and the topic name doubles as the serde tag, so the
//! tag of a decoded message always tells us which topic it belongs on.

use std::fmt::{self, Debug, Formatter};

use alloy::primitives::{Address, B256, Bytes, TxHash, U256};
use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Protocol version stamped on every outbound message.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const TOPIC_HEARTBEAT: &str = "HEARTBEAT";
pub const TOPIC_REQUEST: &str = "MESSAGE:REQUEST";
pub const TOPIC_SIGNED: &str = "MESSAGE:SIGNED";
pub const TOPIC_EXECUTION: &str = "MESSAGE:EXECUTION";
pub const TOPIC_RESET: &str = "MESSAGE:RESET";
pub const TOPIC_PENALTY_TATTLE: &str = "PENALTY:TATTLE";
pub const TOPIC_PENALTY_SIGNED: &str = "PENALTY:SIGNED";
pub const TOPIC_PENALTY_EXECUTION: &str = "PENALTY:EXECUTION";

/// Topic used by pubsub peer discovery. Never carries bridge messages.
pub const TOPIC_PEER_DISCOVERY: &str = "_peer-discovery._p2p._pubsub";

/// Every topic a relay node subscribes to.
pub const TOPICS: [&str; 8] = [
    TOPIC_HEARTBEAT,
    TOPIC_REQUEST,
    TOPIC_SIGNED,
    TOPIC_EXECUTION,
    TOPIC_RESET,
    TOPIC_PENALTY_TATTLE,
    TOPIC_PENALTY_SIGNED,
    TOPIC_PENALTY_EXECUTION,
];

/// Arguments of the gateway's `MessageRequest(txId, destChainId, data)` event, in emission order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRequest {
    pub tx_id: U256,
    pub dest_chain_id: U256,
    pub payload: Bytes,
}

/// A `MessageRequest` event as observed in a block of the source chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedEvent {
    /// Correlation key for the whole lifecycle of one transfer.
    pub transaction_hash: TxHash,
    pub block_hash: B256,
    pub block_number: u64,
    pub args: MessageRequest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub source: u64,
    pub author: Address,
    pub data: ObservedEvent,
}

/// An attestation that `signer` independently verified `data` against its own view of the source chain.
///
/// `signers` and `signatures` are only populated once the message carries the aggregated set that is
/// handed to the destination contract.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signed {
    pub source: u64,
    pub author: Address,
    pub data: ObservedEvent,
    pub signer: Address,
    pub signature: Bytes,
    #[serde(default)]
    pub signers: Vec<Address>,
    #[serde(default)]
    pub signatures: Vec<Bytes>,
}

impl Debug for Signed {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Signed [source: {}, tx: {}, signer: {}, aggregated: {}]",
            self.source,
            self.data.transaction_hash,
            self.signer,
            self.signers.len()
        )
    }
}

/// Published by a transactor once the destination contract accepted the aggregated signatures.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub source: u64,
    pub author: Address,
    pub data: ObservedEvent,
    pub signer: Address,
    pub signers: Vec<Address>,
    pub signatures: Vec<Bytes>,
    pub exec_hash: TxHash,
    pub gas_units: u64,
    pub gas_price: U256,
    pub transaction_fee: U256,
}

/// Clears every lock held for `transaction_hash`, letting the pipeline run again from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reset {
    pub source: u64,
    pub author: Address,
    pub transaction_hash: TxHash,
}

/// An accusation that `accused` gossiped a claim which does not match the source chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tattle {
    pub source: u64,
    pub author: Address,
    pub accused: Address,
    pub data: ObservedEvent,
}

/// A peer's confirmation of a [Tattle], signed over `penalty_digest(accused, transaction_hash)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltySigned {
    pub source: u64,
    pub author: Address,
    pub accused: Address,
    pub data: ObservedEvent,
    pub signer: Address,
    pub signature: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PenaltyExecution {
    pub source: u64,
    pub author: Address,
    pub accused: Address,
    pub data: ObservedEvent,
    pub exec_hash: TxHash,
}

/// Per-chain status reported in heartbeats.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainStatus {
    pub id: u64,
    pub name: String,
    pub key: Address,
    pub block: u64,
    pub txqueue: usize,
    pub brtx: u64,
    pub brrx: u64,
    pub sgtx: u64,
    pub sgrx: u64,
    pub exec: u64,
    pub fail: u64,
    pub gas_price: Option<U256>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    pub author: Address,
    pub peer_id: String,
    pub peers: usize,
    pub chains: Vec<ChainStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BridgeMessage {
    #[serde(rename = "MESSAGE:REQUEST")]
    Request(Request),
    #[serde(rename = "MESSAGE:SIGNED")]
    Signed(Signed),
    #[serde(rename = "MESSAGE:EXECUTION")]
    Execution(Execution),
    #[serde(rename = "MESSAGE:RESET")]
    Reset(Reset),
    #[serde(rename = "PENALTY:TATTLE")]
    PenaltyTattle(Tattle),
    #[serde(rename = "PENALTY:SIGNED")]
    PenaltySigned(PenaltySigned),
    #[serde(rename = "PENALTY:EXECUTION")]
    PenaltyExecution(PenaltyExecution),
    #[serde(rename = "HEARTBEAT")]
    Heartbeat(Heartbeat),
}

impl BridgeMessage {
    /// The gossip topic this message is published on.
    pub fn topic(&self) -> &'static str {
        match self {
            BridgeMessage::Request(_) => TOPIC_REQUEST,
            BridgeMessage::Signed(_) => TOPIC_SIGNED,
            BridgeMessage::Execution(_) => TOPIC_EXECUTION,
            BridgeMessage::Reset(_) => TOPIC_RESET,
            BridgeMessage::PenaltyTattle(_) => TOPIC_PENALTY_TATTLE,
            BridgeMessage::PenaltySigned(_) => TOPIC_PENALTY_SIGNED,
            BridgeMessage::PenaltyExecution(_) => TOPIC_PENALTY_EXECUTION,
            BridgeMessage::Heartbeat(_) => TOPIC_HEARTBEAT,
        }
    }

    /// The chain the underlying event occurred on. Heartbeats are not about any chain.
    pub fn source(&self) -> Option<u64> {
        match self {
            BridgeMessage::Request(m) => Some(m.source),
            BridgeMessage::Signed(m) => Some(m.source),
            BridgeMessage::Execution(m) => Some(m.source),
            BridgeMessage::Reset(m) => Some(m.source),
            BridgeMessage::PenaltyTattle(m) => Some(m.source),
            BridgeMessage::PenaltySigned(m) => Some(m.source),
            BridgeMessage::PenaltyExecution(m) => Some(m.source),
            BridgeMessage::Heartbeat(_) => None,
        }
    }

    pub fn author(&self) -> Address {
        match self {
            BridgeMessage::Request(m) => m.author,
            BridgeMessage::Signed(m) => m.author,
            BridgeMessage::Execution(m) => m.author,
            BridgeMessage::Reset(m) => m.author,
            BridgeMessage::PenaltyTattle(m) => m.author,
            BridgeMessage::PenaltySigned(m) => m.author,
            BridgeMessage::PenaltyExecution(m) => m.author,
            BridgeMessage::Heartbeat(m) => m.author,
        }
    }

    /// The source-chain transaction this message is about.
    pub fn transaction_hash(&self) -> Option<TxHash> {
        match self {
            BridgeMessage::Request(m) => Some(m.data.transaction_hash),
            BridgeMessage::Signed(m) => Some(m.data.transaction_hash),
            BridgeMessage::Execution(m) => Some(m.data.transaction_hash),
            BridgeMessage::Reset(m) => Some(m.transaction_hash),
            BridgeMessage::PenaltyTattle(m) => Some(m.data.transaction_hash),
            BridgeMessage::PenaltySigned(m) => Some(m.data.transaction_hash),
            BridgeMessage::PenaltyExecution(m) => Some(m.data.transaction_hash),
            BridgeMessage::Heartbeat(_) => None,
        }
    }

    /// A short label for log lines.
    pub fn name(&self) -> &'static str {
        self.topic()
    }
}

/// The serialized form of a message on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,
    pub message: BridgeMessage,
}

impl Envelope {
    pub fn new(message: BridgeMessage) -> Self {
        Envelope {
            version: PROTOCOL_VERSION.to_owned(),
            message,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}
