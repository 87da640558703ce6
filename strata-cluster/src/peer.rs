//! Peer registry for the node mesh.
//!
//! Every remote node is tracked under one [`PeerEndpoint`]: either a
//! [`ClientPeer`] wrapping a reconnecting outbound `NetClient`, or a
//! [`ServerPeer`] wrapping the transport the remote dialed at us. The
//! registry keeps exactly one endpoint per node ID; when both sides dial
//! each other at once, the node with the larger ID keeps its outbound
//! link and the other side keeps the inbound one, so the pair settles on
//! a single transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use strata_core::{Result, StrataError};
use strata_net::{ClientEvent, Connection, InboundPacket, NetClient, Packet};

const PEER_QUEUE_SIZE: usize = 256;

/// Splits a `host:port:id` endpoint string.
pub fn parse_server(server: &str) -> Result<(String, u16, u32)> {
    let mut parts = server.rsplitn(3, ':');
    let id = parts.next();
    let port = parts.next();
    let host = parts.next();
    match (host, port, id) {
        (Some(host), Some(port), Some(id)) if !host.is_empty() => {
            let port = port
                .parse::<u16>()
                .map_err(|_| StrataError::Config(format!("bad port in server entry: {server}")))?;
            let id = id
                .parse::<u32>()
                .map_err(|_| StrataError::Config(format!("bad node id in server entry: {server}")))?;
            Ok((host.to_string(), port, id))
        }
        _ => Err(StrataError::Config(format!(
            "server entry must be host:port:id, got: {server}"
        ))),
    }
}

/// Registry-level notifications surfaced to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerEvent {
    /// An outbound transport reached the peer.
    ClientConnected { node_id: u32 },
    /// An outbound client exhausted its retries.
    ClientFailed { node_id: u32 },
}

/// One tracked remote node, whichever side opened the transport.
pub enum PeerEndpoint {
    Client(ClientPeer),
    Server(ServerPeer),
}

impl PeerEndpoint {
    pub fn target_id(&self) -> u32 {
        match self {
            Self::Client(peer) => peer.target_id,
            Self::Server(peer) => peer.target_id,
        }
    }

    pub fn server(&self) -> &str {
        match self {
            Self::Client(peer) => &peer.server,
            Self::Server(peer) => &peer.server,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Self::Client(peer) => peer.client.is_connected(),
            Self::Server(peer) => peer.is_connected(),
        }
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        match self {
            Self::Client(peer) => peer.client.send(packet).await,
            Self::Server(peer) => peer.send(packet).await,
        }
    }

    pub async fn send_sync(&self, request: Packet) -> Result<Packet> {
        match self {
            Self::Client(peer) => peer.client.send_sync(request).await,
            Self::Server(peer) => peer.send_sync(request).await,
        }
    }

    pub fn close(&self) {
        match self {
            Self::Client(peer) => peer.client.shutdown(),
            Self::Server(peer) => peer.close(),
        }
    }
}

/// Outbound endpoint backed by a reconnecting client.
pub struct ClientPeer {
    pub target_id: u32,
    pub server: String,
    pub client: Arc<NetClient>,
}

/// Inbound endpoint backed by the transport the remote dialed. The
/// transport can be swapped when the remote reconnects; queued sends
/// drain to whichever transport is live.
pub struct ServerPeer {
    pub target_id: u32,
    pub server: String,
    conn_tx: watch::Sender<Arc<Connection>>,
    queue: mpsc::Sender<Packet>,
    closed: Arc<AtomicBool>,
}

impl ServerPeer {
    pub fn new(target_id: u32, server: String, connection: Arc<Connection>) -> Self {
        let (conn_tx, conn_rx) = watch::channel(connection);
        let (queue, queue_rx) = mpsc::channel(PEER_QUEUE_SIZE);
        let closed = Arc::new(AtomicBool::new(false));
        tokio::spawn(Self::drain_loop(conn_rx, queue_rx, Arc::clone(&closed)));
        Self {
            target_id,
            server,
            conn_tx,
            queue,
            closed,
        }
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst) && self.conn_tx.borrow().is_connected()
    }

    /// Installs a replacement transport after the remote reconnected.
    pub fn replace_connection(&self, connection: Arc<Connection>) {
        let old = self.conn_tx.send_replace(connection);
        old.close();
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let connection = self.conn_tx.borrow().clone();
        connection.close();
        // Re-send the current transport to wake the drain loop so it
        // observes the closed flag.
        let _ = self.conn_tx.send_replace(connection);
    }

    pub async fn send(&self, packet: Packet) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrataError::Disconnected(format!(
                "peer {} endpoint is closed",
                self.target_id
            )));
        }
        self.queue
            .send(packet)
            .await
            .map_err(|_| StrataError::ChannelClosed("peer send queue"))
    }

    pub async fn send_sync(&self, request: Packet) -> Result<Packet> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StrataError::Disconnected(format!(
                "peer {} endpoint is closed",
                self.target_id
            )));
        }
        let connection = self.conn_tx.borrow().clone();
        connection.send_sync(request).await
    }

    async fn drain_loop(
        mut conn_rx: watch::Receiver<Arc<Connection>>,
        mut queue_rx: mpsc::Receiver<Packet>,
        closed: Arc<AtomicBool>,
    ) {
        while let Some(packet) = queue_rx.recv().await {
            loop {
                if closed.load(Ordering::SeqCst) {
                    return;
                }
                let connection = conn_rx.borrow_and_update().clone();
                if connection.is_connected() && connection.send(packet.clone()).await.is_ok() {
                    break;
                }
                if conn_rx.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

/// Owns the peer map and the single-endpoint-per-node invariant.
pub struct PeerManager {
    node_id: u32,
    listen_port: u16,
    retry_limit: i32,
    default_timeout_ms: u64,
    inbound: mpsc::Sender<InboundPacket>,
    peers: Mutex<HashMap<u32, Arc<PeerEndpoint>>>,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerManager {
    pub fn new(
        node_id: u32,
        listen_port: u16,
        retry_limit: i32,
        default_timeout_ms: u64,
        inbound: mpsc::Sender<InboundPacket>,
        event_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            node_id,
            listen_port,
            retry_limit,
            default_timeout_ms,
            inbound,
            peers: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Opens (or keeps) an outbound link to `server`. Entries for our
    /// own endpoint are skipped.
    pub async fn connect(&self, server: &str) -> Result<()> {
        let mut peers = self.peers.lock().await;
        self.open_outbound(&mut peers, server, false)
    }

    fn open_outbound(
        &self,
        peers: &mut HashMap<u32, Arc<PeerEndpoint>>,
        server: &str,
        force: bool,
    ) -> Result<()> {
        let (host, port, target_id) = parse_server(server)?;
        if target_id == self.node_id && port == self.listen_port {
            return Ok(());
        }
        if !force && peers.contains_key(&target_id) {
            return Ok(());
        }
        if let Some(existing) = peers.remove(&target_id) {
            existing.close();
        }

        let client = NetClient::new(
            format!("peer-{target_id}"),
            format!("{host}:{port}"),
            self.retry_limit,
            self.default_timeout_ms,
            self.inbound.clone(),
        );
        let mut events = client.subscribe();
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ClientEvent::Connected) => {
                        let _ = event_tx.send(PeerEvent::ClientConnected { node_id: target_id });
                    }
                    Ok(ClientEvent::Disconnected) => {}
                    Ok(ClientEvent::ConnectFailed) => {
                        let _ = event_tx.send(PeerEvent::ClientFailed { node_id: target_id });
                        break;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        info!(
            target: "strata::cluster",
            node_id = self.node_id,
            peer = target_id,
            server,
            force,
            "Opening outbound peer link"
        );
        client.start();
        peers.insert(
            target_id,
            Arc::new(PeerEndpoint::Client(ClientPeer {
                target_id,
                server: server.to_string(),
                client,
            })),
        );
        Ok(())
    }

    /// Registers a transport the remote opened toward us, resolving the
    /// simultaneous-dial race. Returns the endpoint that should receive
    /// our announcement, or `None` when this transport was discarded in
    /// favor of a fresh outbound link.
    pub async fn add_inbound_peer(
        &self,
        node_id: u32,
        server: &str,
        connection: Arc<Connection>,
    ) -> Result<Option<Arc<PeerEndpoint>>> {
        let mut peers = self.peers.lock().await;
        match peers.get(&node_id).map(Arc::clone) {
            None => {
                debug!(
                    target: "strata::cluster",
                    node_id = self.node_id,
                    peer = node_id,
                    "Registering inbound peer"
                );
                let endpoint = Arc::new(PeerEndpoint::Server(ServerPeer::new(
                    node_id,
                    server.to_string(),
                    connection,
                )));
                peers.insert(node_id, Arc::clone(&endpoint));
                Ok(Some(endpoint))
            }
            Some(existing) => match existing.as_ref() {
                PeerEndpoint::Server(peer) => {
                    debug!(
                        target: "strata::cluster",
                        node_id = self.node_id,
                        peer = node_id,
                        "Peer reconnected, swapping transport"
                    );
                    peer.replace_connection(connection);
                    Ok(Some(existing))
                }
                PeerEndpoint::Client(_) => {
                    if self.node_id > node_id {
                        // We win the dial race: keep our outbound side
                        // and force it to reconnect on a clean transport.
                        debug!(
                            target: "strata::cluster",
                            node_id = self.node_id,
                            peer = node_id,
                            "Dial race won, keeping outbound link"
                        );
                        connection.close();
                        self.open_outbound(&mut peers, server, true)?;
                        Ok(None)
                    } else {
                        debug!(
                            target: "strata::cluster",
                            node_id = self.node_id,
                            peer = node_id,
                            "Dial race lost, adopting inbound link"
                        );
                        let endpoint = Arc::new(PeerEndpoint::Server(ServerPeer::new(
                            node_id,
                            server.to_string(),
                            connection,
                        )));
                        peers.insert(node_id, Arc::clone(&endpoint));
                        existing.close();
                        Ok(Some(endpoint))
                    }
                }
            },
        }
    }

    pub async fn get(&self, node_id: u32) -> Option<Arc<PeerEndpoint>> {
        self.peers.lock().await.get(&node_id).map(Arc::clone)
    }

    pub async fn remove(&self, node_id: u32) {
        if let Some(endpoint) = self.peers.lock().await.remove(&node_id) {
            endpoint.close();
        }
    }

    pub async fn send(&self, node_id: u32, packet: Packet) -> Result<()> {
        let endpoint = self
            .get(node_id)
            .await
            .ok_or(StrataError::PeerNotFound(node_id))?;
        endpoint.send(packet).await
    }

    pub async fn send_sync(&self, node_id: u32, request: Packet) -> Result<Packet> {
        let endpoint = self
            .get(node_id)
            .await
            .ok_or(StrataError::PeerNotFound(node_id))?;
        endpoint.send_sync(request).await
    }

    /// Fire-and-forget fan-out. Returns the node IDs the packet was
    /// queued for; delivery failures are logged and skipped.
    pub async fn broadcast(&self, packet: &Packet, exclude: Option<u32>) -> Vec<u32> {
        let snapshot: Vec<Arc<PeerEndpoint>> =
            self.peers.lock().await.values().map(Arc::clone).collect();
        let mut reached = Vec::with_capacity(snapshot.len());
        for endpoint in snapshot {
            if Some(endpoint.target_id()) == exclude {
                continue;
            }
            match endpoint.send(packet.clone()).await {
                Ok(()) => reached.push(endpoint.target_id()),
                Err(e) => {
                    warn!(
                        target: "strata::cluster",
                        node_id = self.node_id,
                        peer = endpoint.target_id(),
                        error = %e,
                        "Broadcast send failed"
                    );
                }
            }
        }
        reached
    }

    /// Concurrent request fan-out. Collects the responses that arrived;
    /// peers that time out or fail are dropped from the result.
    pub async fn broadcast_sync(&self, request: &Packet) -> Vec<Packet> {
        let snapshot: Vec<Arc<PeerEndpoint>> =
            self.peers.lock().await.values().map(Arc::clone).collect();
        let mut set = JoinSet::new();
        for endpoint in snapshot {
            let request = request.clone();
            set.spawn(async move {
                let target_id = endpoint.target_id();
                match endpoint.send_sync(request).await {
                    Ok(response) => Some(response),
                    Err(e) => {
                        warn!(
                            target: "strata::cluster",
                            peer = target_id,
                            error = %e,
                            "Broadcast request failed"
                        );
                        None
                    }
                }
            });
        }
        let mut responses = Vec::new();
        while let Some(joined) = set.join_next().await {
            if let Ok(Some(response)) = joined {
                responses.push(response);
            }
        }
        responses
    }

    pub async fn connected_count(&self) -> u32 {
        self.peers
            .lock()
            .await
            .values()
            .filter(|endpoint| endpoint.is_connected())
            .count() as u32
    }

    pub async fn all_servers(&self) -> Vec<String> {
        self.peers
            .lock()
            .await
            .values()
            .map(|endpoint| endpoint.server().to_string())
            .collect()
    }

    pub async fn all_node_ids(&self) -> Vec<u32> {
        self.peers.lock().await.keys().copied().collect()
    }

    pub async fn shutdown(&self) {
        let mut peers = self.peers.lock().await;
        for endpoint in peers.values() {
            endpoint.close();
        }
        peers.clear();
    }
}
