//! Dispatches inbound gossip to the chain drivers.

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, trace, warn};

use crate::{
    driver::ChainDriver,
    heartbeat::HeartbeatBook,
    ledger::ExecutedSet,
    message::{BridgeMessage, Envelope, TOPIC_HEARTBEAT, TOPIC_PEER_DISCOVERY},
};

pub struct Router {
    drivers: HashMap<u64, Arc<ChainDriver>>,
    executed: Arc<ExecutedSet>,
    heartbeats: Arc<HeartbeatBook>,
}

impl Router {
    pub fn new(
        drivers: impl IntoIterator<Item = Arc<ChainDriver>>,
        executed: Arc<ExecutedSet>,
        heartbeats: Arc<HeartbeatBook>,
    ) -> Self {
        Router {
            drivers: drivers
                .into_iter()
                .map(|driver| (driver.chain_id(), driver))
                .collect(),
            executed,
            heartbeats,
        }
    }

    pub fn driver(&self, chain_id: u64) -> Option<&Arc<ChainDriver>> {
        self.drivers.get(&chain_id)
    }

    pub fn executed(&self) -> &Arc<ExecutedSet> {
        &self.executed
    }

    /// Handles one inbound payload. Nothing that goes wrong here is fatal, so failures are logged and
    /// swallowed.
    pub async fn route(&self, topic: &str, data: &[u8]) {
        if topic == TOPIC_PEER_DISCOVERY {
            return;
        }
        let message = match Envelope::decode(data) {
            Ok(envelope) => envelope.message,
            Err(e) => {
                debug!(topic, %e, "dropping undecodable message");
                return;
            }
        };

        if topic == TOPIC_HEARTBEAT {
            if let BridgeMessage::Heartbeat(heartbeat) = message {
                self.heartbeats.record(heartbeat);
            }
            return;
        }
        if message.topic() != topic {
            warn!(topic, message_type = message.name(), "message published on the wrong topic");
            return;
        }

        // Resets must get through to clear the very hashes this filter would drop, and executions must get
        // through to upgrade a locally done hash to executed.
        let terminal_or_reset = matches!(
            message,
            BridgeMessage::Reset(_) | BridgeMessage::Execution(_) | BridgeMessage::PenaltyExecution(_)
        );
        if let Some(hash) = message.transaction_hash() {
            if !terminal_or_reset && self.executed.is_done(hash) {
                trace!(%hash, message_type = message.name(), "ignoring message for executed hash");
                return;
            }
        }

        match message {
            BridgeMessage::Execution(execution) => {
                let hash = execution.data.transaction_hash;
                self.executed.mark_executed(hash);
                debug!(%hash, exec_hash = %execution.exec_hash, author = %execution.author, "EXEC");
                return;
            }
            BridgeMessage::PenaltyExecution(execution) => {
                let hash = execution.data.transaction_hash;
                self.executed.mark_done(hash);
                debug!(%hash, accused = %execution.accused, "PEXE");
                return;
            }
            BridgeMessage::Heartbeat(_) => return,
            _ => {}
        }

        let Some(source) = message.source() else {
            return;
        };
        let Some(driver) = self.drivers.get(&source) else {
            debug!(source, message_type = message.name(), "no driver for chain");
            return;
        };

        let message_type = message.name();
        let result = match message {
            BridgeMessage::Request(request) => driver.process_message_request(request).await,
            BridgeMessage::Signed(signed) => driver.process_message_signed(signed).await,
            BridgeMessage::Reset(reset) => {
                driver.process_message_reset(reset);
                Ok(())
            }
            BridgeMessage::PenaltyTattle(tattle) => driver.process_penalty_tattle(tattle).await,
            BridgeMessage::PenaltySigned(signed) => {
                driver.process_penalty_signed(signed);
                Ok(())
            }
            BridgeMessage::Execution(_)
            | BridgeMessage::PenaltyExecution(_)
            | BridgeMessage::Heartbeat(_) => Ok(()),
        };
        if let Err(e) = result {
            warn!(source, message_type, %e, "failed to handle message");
        }
    }
}
