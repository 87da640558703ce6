//! Node-level wiring: server, peer registry, election, and the worker
//! pool that drains inbound packets.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, info, warn};

use strata_core::{Result, StrataError, DEFAULT_REQUEST_TIMEOUT_MS};
use strata_net::{InboundPacket, NetServer, Packet, PacketType};

use crate::election::ControllerElection;
use crate::messages::{ControllerVote, PeerAware};
use crate::peer::{PeerEndpoint, PeerEvent, PeerManager};

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This node's ID; must be unique across the cluster.
    pub node_id: u32,
    pub listen_port: u16,
    /// Host other nodes use to reach us, as announced in `host:port:id`.
    pub advertise_host: String,
    /// Full cluster roster as `host:port:id`, our own entry included.
    pub peer_servers: Vec<String>,
    /// Workers draining the shared inbound packet queue.
    pub worker_count: usize,
    pub inbound_queue: usize,
    /// Reconnect attempts per peer before giving up; `-1` is unlimited.
    pub retry_limit: i32,
    pub default_timeout_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            listen_port: 8001,
            advertise_host: "localhost".to_string(),
            peer_servers: Vec::new(),
            worker_count: 4,
            inbound_queue: 256,
            retry_limit: -1,
            default_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl ClusterConfig {
    pub fn num_of_node(&self) -> u32 {
        self.peer_servers.len() as u32
    }

    fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    fn advertised_server(&self) -> String {
        format!("{}:{}:{}", self.advertise_host, self.listen_port, self.node_id)
    }
}

pub struct NodeCoordinator {
    config: ClusterConfig,
    peers: Arc<PeerManager>,
    election: Arc<ControllerElection>,
    server: Arc<NetServer>,
    shutdown_tx: broadcast::Sender<()>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundPacket>>>,
    peer_event_rx: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
}

impl NodeCoordinator {
    pub fn new(config: ClusterConfig) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_queue);
        let (peer_event_tx, peer_event_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = broadcast::channel(4);

        let peers = Arc::new(PeerManager::new(
            config.node_id,
            config.listen_port,
            config.retry_limit,
            config.default_timeout_ms,
            inbound_tx.clone(),
            peer_event_tx,
        ));
        let election = ControllerElection::new(
            config.node_id,
            config.num_of_node(),
            Arc::clone(&peers),
        );
        let server = Arc::new(NetServer::new(
            format!("node-{}", config.node_id),
            config.default_timeout_ms,
            inbound_tx,
        ));

        Arc::new(Self {
            config,
            peers,
            election,
            server,
            shutdown_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            peer_event_rx: Mutex::new(Some(peer_event_rx)),
        })
    }

    pub fn node_id(&self) -> u32 {
        self.config.node_id
    }

    pub fn controller(&self) -> Option<u32> {
        self.election.controller()
    }

    pub fn controller_watch(&self) -> tokio::sync::watch::Receiver<Option<u32>> {
        self.election.controller_watch()
    }

    pub async fn connected_peers(&self) -> u32 {
        self.peers.connected_count().await
    }

    /// Boots the node: listener, inbound workers, peer event loop, and
    /// the outbound dials to the configured roster.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            target: "strata::cluster",
            node_id = self.config.node_id,
            listen_port = self.config.listen_port,
            cluster_size = self.config.num_of_node(),
            "Starting node"
        );

        let inbound_rx = self
            .inbound_rx
            .lock()
            .await
            .take()
            .ok_or(StrataError::ChannelClosed("inbound queue already claimed"))?;
        let inbound_rx = Arc::new(Mutex::new(inbound_rx));
        for worker in 0..self.config.worker_count.max(1) {
            let coordinator = Arc::clone(self);
            let inbound_rx = Arc::clone(&inbound_rx);
            tokio::spawn(async move {
                loop {
                    let inbound = { inbound_rx.lock().await.recv().await };
                    let Some(inbound) = inbound else { break };
                    coordinator.handle_packet(inbound).await;
                }
                debug!(target: "strata::cluster", worker, "Inbound worker stopped");
            });
        }

        let server = Arc::clone(&self.server);
        let listen_addr = self.config.listen_addr();
        let shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = server.run(&listen_addr, shutdown_rx).await {
                error!(target: "strata::cluster", error = %e, "Listener failed");
            }
        });

        if let Some(mut peer_event_rx) = self.peer_event_rx.lock().await.take() {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(event) = peer_event_rx.recv().await {
                    coordinator.handle_peer_event(event).await;
                }
            });
        }

        for server in &self.config.peer_servers {
            self.peers.connect(server).await?;
        }
        Ok(())
    }

    async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::ClientConnected { node_id } => {
                if let Some(peer) = self.peers.get(node_id).await {
                    if let Err(e) = self.report_self(&peer, true).await {
                        warn!(
                            target: "strata::cluster",
                            node_id = self.config.node_id,
                            peer = node_id,
                            error = %e,
                            "Failed to announce to peer"
                        );
                    }
                }
            }
            PeerEvent::ClientFailed { node_id } => {
                warn!(
                    target: "strata::cluster",
                    node_id = self.config.node_id,
                    peer = node_id,
                    "Peer unreachable, dropping endpoint"
                );
                self.peers.remove(node_id).await;
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, inbound: InboundPacket) {
        match inbound.packet.packet_type() {
            PacketType::PeerAware => {
                let Some(aware) = PeerAware::from_bytes(&inbound.packet.body) else {
                    warn!(
                        target: "strata::cluster",
                        node_id = self.config.node_id,
                        "Discarding malformed peer announcement"
                    );
                    return;
                };
                if aware.is_client {
                    // The dialing side announced itself over a fresh
                    // transport; register it and answer in kind.
                    match self
                        .peers
                        .add_inbound_peer(
                            aware.node_id,
                            &aware.server,
                            Arc::clone(&inbound.connection),
                        )
                        .await
                    {
                        Ok(Some(peer)) => {
                            if let Err(e) = self.report_self(&peer, false).await {
                                warn!(
                                    target: "strata::cluster",
                                    node_id = self.config.node_id,
                                    peer = aware.node_id,
                                    error = %e,
                                    "Failed to answer announcement"
                                );
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                target: "strata::cluster",
                                node_id = self.config.node_id,
                                peer = aware.node_id,
                                error = %e,
                                "Failed to register inbound peer"
                            );
                            return;
                        }
                    }
                }
                self.election.on_peer_aware(&aware).await;
            }
            PacketType::ControllerVote => {
                let Some(vote) = ControllerVote::from_bytes(&inbound.packet.body) else {
                    warn!(
                        target: "strata::cluster",
                        node_id = self.config.node_id,
                        "Discarding malformed controller vote"
                    );
                    return;
                };
                self.election
                    .on_controller_vote(vote, &inbound.packet, &inbound.connection)
                    .await;
            }
            PacketType::Unknown => {
                debug!(
                    target: "strata::cluster",
                    node_id = self.config.node_id,
                    "Ignoring packet with unknown type"
                );
            }
        }
    }

    async fn report_self(&self, peer: &Arc<PeerEndpoint>, is_client: bool) -> Result<()> {
        let aware = PeerAware {
            node_id: self.config.node_id,
            server: self.config.advertised_server(),
            num_of_node: self.election.num_of_node(),
            servers: self.peers.all_servers().await,
            is_client,
        };
        let packet = Packet::new(PacketType::PeerAware, aware.to_bytes());
        peer.send(packet).await
    }

    /// Stops the listener and closes every peer endpoint.
    pub async fn shutdown(&self) {
        info!(
            target: "strata::cluster",
            node_id = self.config.node_id,
            "Shutting down node"
        );
        let _ = self.shutdown_tx.send(());
        self.peers.shutdown().await;
    }
}
