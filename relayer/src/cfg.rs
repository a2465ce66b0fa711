use std::{collections::HashSet, time::Duration};

use alloy::primitives::Address;
use anyhow::{Result, anyhow};
use libp2p::{Multiaddr, PeerId};
use serde::Deserialize;

use crate::crypto::SecretKey;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// The port to listen for P2P messages on. Optional - If not provided a random port will be used.
    #[serde(default)]
    pub p2p_port: u16,
    /// Other relay nodes to dial when this node starts. Peers on the local network are also found via mDNS.
    #[serde(default)]
    pub bootstrap_address: Vec<(PeerId, Multiaddr)>,
    /// Every chain this node bridges between.
    pub chains: Vec<ChainConfig>,
    /// Hex-encoded keys of the accounts that submit executions to destination chains. A node without
    /// transactors still verifies and signs, but never executes.
    #[serde(default)]
    pub transactors: Vec<SecretKey>,
    /// How often to publish a heartbeat. Defaults to 30 seconds.
    #[serde(default = "heartbeat_interval_default")]
    pub heartbeat_interval: Duration,
    /// Admin JSON-RPC server. Disabled if not set.
    #[serde(default)]
    pub admin_api: Option<AdminApiConfig>,
    /// The base address of the OTLP collector. If not set, metrics will not be exported.
    #[serde(default)]
    pub otlp_collector_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminApiConfig {
    /// The port to listen for admin JSON-RPC requests on.
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url: String,
    /// Address of the gateway contract. Only logs emitted by this address are treated as bridge requests.
    pub gateway_address: Address,
    /// Number of confirmations an event needs before it is verified.
    #[serde(default)]
    pub finality: u64,
    /// First block to scan for requests. Defaults to the chain head at startup.
    #[serde(default)]
    pub start_block: Option<u64>,
    /// How often to poll the chain for its height and for new requests. Defaults to 1 second.
    #[serde(default = "poll_interval_default")]
    pub poll_interval: Duration,
    /// Percentage applied to gas estimates before submitting an execution. Defaults to 110.
    #[serde(default = "gas_multiplier_percent_default")]
    pub gas_multiplier_percent: u64,
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.chains.is_empty() {
            return Err(anyhow!("at least one chain must be configured"));
        }
        let mut seen = HashSet::new();
        for chain in &self.chains {
            if !seen.insert(chain.chain_id) {
                return Err(anyhow!(
                    "chain id {} is configured more than once",
                    chain.chain_id
                ));
            }
            if chain.gas_multiplier_percent < 100 {
                return Err(anyhow!(
                    "gas_multiplier_percent for {} must be at least 100, got {}",
                    chain.name,
                    chain.gas_multiplier_percent
                ));
            }
        }
        Ok(())
    }
}

pub fn heartbeat_interval_default() -> Duration {
    Duration::from_secs(30)
}

pub fn poll_interval_default() -> Duration {
    Duration::from_secs(1)
}

pub fn gas_multiplier_percent_default() -> u64 {
    110
}
