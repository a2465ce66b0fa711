//! The gossip transport between relay nodes.

use std::time::Duration;

use anyhow::{Result, anyhow};
use libp2p::{
    Multiaddr, PeerId, Swarm, SwarmBuilder,
    futures::StreamExt,
    gossipsub::{self, IdentTopic, MessageAuthenticity},
    identify,
    kad::{self, store::MemoryStore},
    mdns,
    multiaddr::Protocol,
    noise,
    swarm::{NetworkBehaviour, SwarmEvent},
    tcp, yamux,
};
use tokio::{
    select,
    signal::{self, unix::SignalKind},
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        watch,
    },
};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use crate::{
    crypto::SecretKey,
    message::{BridgeMessage, Envelope, TOPIC_PEER_DISCOVERY, TOPICS},
};

/// A payload received from the network, or from ourselves: `(source, topic, payload)`.
pub type InboundMessage = (PeerId, String, Vec<u8>);

/// Cheaply cloneable handle for publishing messages to every peer, this node included.
#[derive(Debug, Clone)]
pub struct MessageSender {
    outbound_channel: UnboundedSender<BridgeMessage>,
}

impl MessageSender {
    pub fn new(outbound_channel: UnboundedSender<BridgeMessage>) -> Self {
        MessageSender { outbound_channel }
    }

    /// Creates a sender along with the receiving end the transport drains.
    pub fn channel() -> (MessageSender, UnboundedReceiver<BridgeMessage>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (MessageSender::new(sender), receiver)
    }

    /// Broadcast to the entire network
    pub fn broadcast(&self, message: BridgeMessage) -> Result<()> {
        debug!(message_type = message.name(), "broadcasting");
        self.outbound_channel.send(message)?;
        Ok(())
    }
}

#[derive(NetworkBehaviour)]
struct Behaviour {
    gossipsub: gossipsub::Behaviour,
    mdns: mdns::tokio::Behaviour,
    identify: identify::Behaviour,
    kademlia: kad::Behaviour<MemoryStore>,
}

pub struct P2pNode {
    peer_id: PeerId,
    p2p_port: u16,
    swarm: Swarm<Behaviour>,
    bootstrap_address: Vec<(PeerId, Multiaddr)>,
    /// Messages from the local drivers, to be published.
    outbound_message_receiver: UnboundedReceiverStream<BridgeMessage>,
    /// Every payload received, including our own broadcasts.
    inbound_message_sender: UnboundedSender<InboundMessage>,
    peers: watch::Sender<usize>,
}

impl P2pNode {
    pub fn new(
        secret_key: &SecretKey,
        p2p_port: u16,
        bootstrap_address: Vec<(PeerId, Multiaddr)>,
        outbound_message_receiver: UnboundedReceiver<BridgeMessage>,
        inbound_message_sender: UnboundedSender<InboundMessage>,
    ) -> Result<Self> {
        let key_pair = secret_key.to_libp2p_keypair();
        let peer_id = PeerId::from(key_pair.public());
        info!(%peer_id);

        let mut swarm = SwarmBuilder::with_existing_identity(key_pair)
            .with_tokio()
            .with_tcp(
                tcp::Config::default(),
                noise::Config::new,
                yamux::Config::default,
            )?
            .with_behaviour(|key_pair| {
                Ok(Behaviour {
                    gossipsub: gossipsub::Behaviour::new(
                        MessageAuthenticity::Signed(key_pair.clone()),
                        gossipsub::ConfigBuilder::default()
                            .max_transmit_size(524288)
                            .build()?,
                    )
                    .map_err(|e| anyhow!(e))?,
                    mdns: mdns::Behaviour::new(Default::default(), peer_id)?,
                    identify: identify::Behaviour::new(identify::Config::new(
                        "/relayer/id/1.0.0".to_owned(),
                        key_pair.public(),
                    )),
                    kademlia: kad::Behaviour::new(peer_id, MemoryStore::new(peer_id)),
                })
            })?
            .with_swarm_config(|config| {
                config.with_idle_connection_timeout(Duration::from_secs(60))
            })
            .build();

        for topic in TOPICS {
            swarm
                .behaviour_mut()
                .gossipsub
                .subscribe(&IdentTopic::new(topic))?;
        }

        let (peers, _) = watch::channel(0);

        Ok(Self {
            peer_id,
            p2p_port,
            swarm,
            bootstrap_address,
            outbound_message_receiver: UnboundedReceiverStream::new(outbound_message_receiver),
            inbound_message_sender,
            peers,
        })
    }

    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    /// Number of currently connected peers.
    pub fn peers(&self) -> watch::Receiver<usize> {
        self.peers.subscribe()
    }

    fn forward_inbound(&self, source: PeerId, topic: String, data: Vec<u8>) -> Result<()> {
        self.inbound_message_sender.send((source, topic, data))?;
        Ok(())
    }

    /// Runs the swarm until SIGTERM or Ctrl-C.
    pub async fn start(&mut self) -> Result<()> {
        let mut addr: Multiaddr = "/ip4/0.0.0.0".parse()?;
        addr.push(Protocol::Tcp(self.p2p_port));

        self.swarm.listen_on(addr)?;

        if !self.bootstrap_address.is_empty() {
            for (peer, address) in &self.bootstrap_address {
                self.swarm
                    .behaviour_mut()
                    .kademlia
                    .add_address(peer, address.clone());
                self.swarm.behaviour_mut().gossipsub.add_explicit_peer(peer);
            }
            self.swarm.behaviour_mut().kademlia.bootstrap()?;
        }

        let mut terminate = signal::unix::signal(SignalKind::terminate())?;

        loop {
            select! {
                event = self.swarm.select_next_some() => match event {
                    SwarmEvent::NewListenAddr { address, .. } => {
                        info!(%address, "started listening");
                    }
                    SwarmEvent::ConnectionEstablished { .. } | SwarmEvent::ConnectionClosed { .. } => {
                        self.peers.send_replace(self.swarm.connected_peers().count());
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Discovered(list))) => {
                        for (peer_id, addr) in list {
                            info!(%peer_id, %addr, "discovered peer via mDNS");
                            self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                            self.swarm.behaviour_mut().gossipsub.add_explicit_peer(&peer_id);
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Mdns(mdns::Event::Expired(list))) => {
                        for (peer_id, addr) in list {
                            self.swarm.behaviour_mut().kademlia.remove_address(&peer_id, &addr);
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Identify(identify::Event::Received { info, peer_id, .. })) => {
                        for addr in info.listen_addrs {
                            debug!(%peer_id, %addr, "identity info received");
                            self.swarm.behaviour_mut().kademlia.add_address(&peer_id, addr);
                        }
                    }
                    SwarmEvent::Behaviour(BehaviourEvent::Gossipsub(gossipsub::Event::Message {
                        propagation_source,
                        message,
                        ..
                    })) => {
                        let topic = message.topic.as_str();
                        if topic == TOPIC_PEER_DISCOVERY {
                            continue;
                        }
                        let source = message.source.unwrap_or(propagation_source);
                        debug!(%source, topic, "broadcast received");
                        self.forward_inbound(source, topic.to_owned(), message.data)?;
                    }
                    _ => {},
                },
                message = self.outbound_message_receiver.next() => {
                    let Some(message) = message else {
                        info!("all senders dropped, stopping");
                        break;
                    };
                    let topic = message.topic();
                    let data = match Envelope::new(message).encode() {
                        Ok(data) => data,
                        Err(e) => {
                            error!(%e, topic, "failed to encode message");
                            continue;
                        }
                    };
                    if let Err(e) = self.swarm.behaviour_mut().gossipsub.publish(IdentTopic::new(topic), data.clone()) {
                        // Expected while we have no peers; we still deliver to ourselves below.
                        warn!(%e, topic, "failed to publish message");
                    }
                    // Also broadcast the message to ourselves.
                    self.forward_inbound(self.peer_id, topic.to_owned(), data)?;
                },
                _ = terminate.recv() => {
                    break;
                },
                _ = signal::ctrl_c() => {
                    break;
                },
            }
        }
        Ok(())
    }
}
