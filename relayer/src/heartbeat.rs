//! Periodic liveness reports, ours and our peers'.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use alloy::primitives::Address;
use parking_lot::RwLock;
use tokio::{sync::watch, time};
use tracing::{trace, warn};

use crate::{
    driver::ChainDriver,
    message::{BridgeMessage, ChainStatus, Heartbeat},
    p2p_node::MessageSender,
};

/// The latest heartbeat received from each node.
#[derive(Debug, Default)]
pub struct HeartbeatBook {
    latest: RwLock<BTreeMap<Address, Heartbeat>>,
}

impl HeartbeatBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, heartbeat: Heartbeat) {
        trace!(author = %heartbeat.author, peer_id = %heartbeat.peer_id, "heartbeat");
        self.latest.write().insert(heartbeat.author, heartbeat);
    }

    pub fn snapshot(&self) -> BTreeMap<Address, Heartbeat> {
        self.latest.read().clone()
    }
}

pub struct HeartbeatReporter {
    pub author: Address,
    pub peer_id: String,
    pub peers: watch::Receiver<usize>,
    pub drivers: Vec<Arc<ChainDriver>>,
    pub interval: Duration,
    pub sender: MessageSender,
}

impl HeartbeatReporter {
    pub async fn chains(drivers: &[Arc<ChainDriver>]) -> Vec<ChainStatus> {
        let mut chains = Vec::with_capacity(drivers.len());
        for driver in drivers {
            chains.push(driver.status().await);
        }
        chains.sort_by_key(|status| status.id);
        chains
    }

    pub async fn heartbeat(&self) -> Heartbeat {
        let peers = *self.peers.borrow();
        Heartbeat {
            author: self.author,
            peer_id: self.peer_id.clone(),
            peers,
            chains: Self::chains(&self.drivers).await,
        }
    }

    pub async fn run(self) {
        let mut interval = time::interval(self.interval);
        // The first tick completes immediately; report once the node has had time to connect.
        interval.tick().await;
        loop {
            interval.tick().await;
            let heartbeat = self.heartbeat().await;
            if let Err(e) = self.sender.broadcast(BridgeMessage::Heartbeat(heartbeat)) {
                warn!(%e, "failed to send heartbeat");
            }
        }
    }
}
