//! Wires the drivers, router, ledgers and background tasks of one relay node together.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use libp2p::PeerId;
use tokio::{
    sync::{mpsc::UnboundedReceiver, watch},
    task::JoinSet,
};
use tracing::{info, trace, warn};

use crate::{
    api::{self, AdminContext},
    cfg::{ChainConfig, Config},
    client::ChainClient,
    crypto::SecretKey,
    driver::ChainDriver,
    evm::EvmChainClient,
    heartbeat::{HeartbeatBook, HeartbeatReporter},
    ledger::{ExecutedSet, SignatureLedger},
    p2p_node::{InboundMessage, MessageSender},
    router::Router,
    transactor::TransactorQueue,
};

struct ChainTasks {
    driver: Arc<ChainDriver>,
    queues: Vec<TransactorQueue>,
    start_block: Option<u64>,
}

pub struct RelayNode {
    config: Config,
    key: SecretKey,
    chains: Vec<ChainTasks>,
    router: Arc<Router>,
    heartbeats: Arc<HeartbeatBook>,
    sender: MessageSender,
}

impl RelayNode {
    /// Connects to every configured chain.
    pub async fn new(config: Config, key: SecretKey, sender: MessageSender) -> Result<Self> {
        let mut clients: Vec<Arc<dyn ChainClient>> = Vec::with_capacity(config.chains.len());
        for chain in &config.chains {
            let client = EvmChainClient::connect(chain, &config.transactors).await?;
            info!(chain_id = chain.chain_id, name = %chain.name, "connected");
            clients.push(Arc::new(client));
        }
        Self::with_clients(config, key, sender, clients)
    }

    /// Builds a node over already connected clients, one per configured chain.
    pub fn with_clients(
        config: Config,
        key: SecretKey,
        sender: MessageSender,
        clients: Vec<Arc<dyn ChainClient>>,
    ) -> Result<Self> {
        config.validate()?;

        let executed = Arc::new(ExecutedSet::new());
        let signatures = Arc::new(SignatureLedger::new());
        let heartbeats = Arc::new(HeartbeatBook::new());

        let chains = config
            .chains
            .iter()
            .map(|chain: &ChainConfig| {
                let client = clients
                    .iter()
                    .find(|c| c.chain_id() == chain.chain_id)
                    .ok_or_else(|| anyhow!("no client for chain {}", chain.chain_id))?
                    .clone();
                let (driver, queues) = ChainDriver::new(
                    chain,
                    client,
                    key.clone(),
                    executed.clone(),
                    signatures.clone(),
                    sender.clone(),
                );
                Ok(ChainTasks {
                    driver,
                    queues,
                    start_block: chain.start_block,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let router = Arc::new(Router::new(
            chains.iter().map(|c| c.driver.clone()),
            executed,
            heartbeats.clone(),
        ));

        Ok(RelayNode {
            config,
            key,
            chains,
            router,
            heartbeats,
            sender,
        })
    }

    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    pub fn drivers(&self) -> Vec<Arc<ChainDriver>> {
        self.chains.iter().map(|c| c.driver.clone()).collect()
    }

    /// Starts every background task and routes inbound payloads until the transport closes the channel.
    pub async fn start(
        self,
        peer_id: PeerId,
        peers: watch::Receiver<usize>,
        mut inbound: UnboundedReceiver<InboundMessage>,
    ) -> Result<()> {
        let drivers = self.drivers();
        let mut tasks = JoinSet::new();

        for chain in self.chains {
            tasks.spawn(chain.driver.clone().watch_height());
            tasks.spawn(chain.driver.clone().watch_events(chain.start_block));
            for queue in chain.queues {
                tasks.spawn(chain.driver.clone().run_transactor(queue));
            }
        }

        tasks.spawn(
            HeartbeatReporter {
                author: self.key.address(),
                peer_id: peer_id.to_string(),
                peers,
                drivers: drivers.clone(),
                interval: self.config.heartbeat_interval,
                sender: self.sender.clone(),
            }
            .run(),
        );

        let _admin_api = match &self.config.admin_api {
            Some(admin) => {
                let module = api::rpc_module(AdminContext {
                    author: self.key.address(),
                    heartbeats: self.heartbeats.clone(),
                    drivers,
                    sender: self.sender.clone(),
                })?;
                Some(api::launch(admin.port, module).await?)
            }
            None => None,
        };

        info!(address = %self.key.address(), %peer_id, "relay node started");

        while let Some((source, topic, data)) = inbound.recv().await {
            let router = self.router.clone();
            // Messages about different hashes are handled concurrently. Handling of a single hash is serialized
            // by the claims in the executed set.
            tokio::spawn(async move {
                trace!(%source, %topic, "routing");
                router.route(&topic, &data).await;
            });
        }

        warn!("inbound channel closed, stopping relay node");
        tasks.shutdown().await;
        Ok(())
    }
}
