//! Reconnecting outbound connection.
//!
//! A `NetClient` owns one logical link to a remote address. The connect
//! loop dials, hands the socket to a [`Connection`], waits for it to
//! die, and retries on a fixed backoff up to an optional bound
//! (`-1` = unlimited). Plain sends are queued and flushed once a
//! transport is live, so callers never block on a reconnect in
//! progress.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info, warn};

use strata_core::{Result, StrataError, RECONNECT_INTERVAL_MS};

use crate::connection::{Connection, InboundPacket};
use crate::packet::Packet;

const SEND_QUEUE_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientEvent {
    /// A transport to the remote is live.
    Connected,
    /// The live transport died; a reconnect is scheduled if retries remain.
    Disconnected,
    /// The retry bound was exhausted and the client shut itself down.
    ConnectFailed,
}

pub struct NetClient {
    name: String,
    addr: String,
    /// Number of reconnect attempts before giving up; `-1` retries forever.
    retry_limit: i32,
    default_timeout_ms: u64,
    inbound: mpsc::Sender<InboundPacket>,
    started: AtomicBool,
    connected: watch::Sender<bool>,
    current: RwLock<Option<Arc<Connection>>>,
    queue: mpsc::Sender<Packet>,
    queue_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    events: broadcast::Sender<ClientEvent>,
}

impl NetClient {
    pub fn new(
        name: impl Into<String>,
        addr: impl Into<String>,
        retry_limit: i32,
        default_timeout_ms: u64,
        inbound: mpsc::Sender<InboundPacket>,
    ) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        let (events, _) = broadcast::channel(16);
        let (queue, queue_rx) = mpsc::channel(SEND_QUEUE_SIZE);
        Arc::new(Self {
            name: name.into(),
            addr: addr.into(),
            retry_limit,
            default_timeout_ms,
            inbound,
            started: AtomicBool::new(false),
            connected,
            current: RwLock::new(None),
            queue,
            queue_rx: Mutex::new(Some(queue_rx)),
            events,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.current.read().ok().and_then(|guard| guard.clone())
    }

    /// Starts the connect and send-drain loops. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue_rx = self.queue_rx.lock().ok().and_then(|mut slot| slot.take());
        let Some(queue_rx) = queue_rx else {
            warn!(
                target: "strata::net",
                client = %self.name,
                "Client was already started once, refusing to restart"
            );
            return;
        };
        tokio::spawn(Arc::clone(self).connect_loop());
        tokio::spawn(Arc::clone(self).drain_loop(queue_rx));
    }

    /// Stops retrying and closes the live transport, if any.
    pub fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(target: "strata::net", client = %self.name, "Shutting down client");
        if let Ok(guard) = self.current.read() {
            if let Some(connection) = guard.as_ref() {
                connection.close();
            }
        }
        let _ = self.connected.send_replace(false);
    }

    /// Waits for a live transport. `timeout_ms < 0` waits indefinitely,
    /// `0` checks once, `> 0` bounds the wait.
    pub async fn ensure_connected(&self, timeout_ms: i64) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if !self.is_started() {
            return Err(StrataError::Disconnected(format!(
                "client {} is not running",
                self.name
            )));
        }
        if timeout_ms == 0 {
            return Err(StrataError::Disconnected(format!(
                "client {} is not connected",
                self.name
            )));
        }

        let mut connected = self.connected.subscribe();
        let wait = async {
            loop {
                if *connected.borrow() {
                    return Ok(());
                }
                if !self.is_started() {
                    return Err(StrataError::Disconnected(format!(
                        "client {} gave up reconnecting",
                        self.name
                    )));
                }
                if connected.changed().await.is_err() {
                    return Err(StrataError::ChannelClosed("client connected watch"));
                }
            }
        };

        if timeout_ms < 0 {
            wait.await
        } else {
            match tokio::time::timeout(Duration::from_millis(timeout_ms as u64), wait).await {
                Ok(outcome) => outcome,
                Err(_) => Err(StrataError::ConnectTimeout(timeout_ms as u64)),
            }
        }
    }

    /// Queues a packet; it is written once a transport is live. Fails
    /// fast only when the client has been shut down.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if !self.is_started() {
            return Err(StrataError::Disconnected(format!(
                "client {} is not running",
                self.name
            )));
        }
        self.queue
            .send(packet)
            .await
            .map_err(|_| StrataError::ChannelClosed("client send queue"))
    }

    /// Synchronous request over the live transport. The connect wait is
    /// bounded by the bridge default timeout so fan-out callers are not
    /// parked forever on a dead peer.
    pub async fn send_sync(&self, request: Packet) -> Result<Packet> {
        self.ensure_connected(self.default_timeout_ms as i64).await?;
        let connection = self.connection().ok_or_else(|| {
            StrataError::Disconnected(format!("client {} lost its transport", self.name))
        })?;
        connection.send_sync(request).await
    }

    async fn connect_loop(self: Arc<Self>) {
        let mut attempts: u32 = 0;
        while self.is_started() {
            match TcpStream::connect(&self.addr).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(target: "strata::net", client = %self.name, error = %e, "set_nodelay failed");
                    }
                    attempts = 0;
                    info!(
                        target: "strata::net",
                        client = %self.name,
                        addr = %self.addr,
                        "Connected to peer"
                    );
                    let connection = Connection::spawn(
                        stream,
                        self.name.clone(),
                        self.inbound.clone(),
                        self.default_timeout_ms,
                    );
                    if let Ok(mut guard) = self.current.write() {
                        *guard = Some(Arc::clone(&connection));
                    }
                    let _ = self.connected.send_replace(true);
                    let _ = self.events.send(ClientEvent::Connected);

                    connection.wait_closed().await;

                    let _ = self.connected.send_replace(false);
                    if let Ok(mut guard) = self.current.write() {
                        *guard = None;
                    }
                    let _ = self.events.send(ClientEvent::Disconnected);
                    if !self.is_started() {
                        break;
                    }
                    warn!(
                        target: "strata::net",
                        client = %self.name,
                        addr = %self.addr,
                        "Connection lost, scheduling reconnect"
                    );
                }
                Err(e) => {
                    warn!(
                        target: "strata::net",
                        client = %self.name,
                        addr = %self.addr,
                        attempt = attempts + 1,
                        error = %e,
                        "Failed to connect"
                    );
                }
            }

            attempts += 1;
            if self.retry_limit >= 0 && attempts > self.retry_limit as u32 {
                error!(
                    target: "strata::net",
                    client = %self.name,
                    addr = %self.addr,
                    attempts,
                    "Retry bound exhausted, giving up on peer"
                );
                self.started.store(false, Ordering::SeqCst);
                let _ = self.connected.send_replace(false);
                let _ = self.events.send(ClientEvent::ConnectFailed);
                break;
            }
            tokio::time::sleep(Duration::from_millis(RECONNECT_INTERVAL_MS)).await;
        }
    }

    /// Flushes queued sends whenever a transport is live, preserving
    /// queue order across reconnects.
    async fn drain_loop(self: Arc<Self>, mut queue_rx: mpsc::Receiver<Packet>) {
        let mut connected = self.connected.subscribe();
        while let Some(packet) = queue_rx.recv().await {
            loop {
                if !self.is_started() {
                    return;
                }
                if let Some(connection) = self.connection() {
                    if connection.is_connected() && connection.send(packet.clone()).await.is_ok() {
                        break;
                    }
                }
                if connected.changed().await.is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn client_connects_and_round_trips() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, mut server_rx) = mpsc::channel(16);
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let _conn = Connection::spawn(stream, "acceptor", server_tx, 2_000);
            while let Some(inbound) = server_rx.recv().await {
                let reply = Packet::new(PacketType::Unknown, inbound.packet.body.clone());
                inbound.connection.reply_to(&inbound.packet, reply).await.unwrap();
            }
        });

        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let client = NetClient::new("test-client", addr.to_string(), -1, 2_000, inbound_tx);
        client.start();
        client.ensure_connected(5_000).await.unwrap();

        let response = client
            .send_sync(Packet::new(PacketType::Unknown, Bytes::from_static(b"echo")))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"echo");

        client.shutdown();
        assert!(!client.is_started());
    }

    #[tokio::test(start_paused = true)]
    async fn bounded_retries_emit_connect_failed() {
        // Port 1 on localhost refuses immediately.
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let client = NetClient::new("doomed", "127.0.0.1:1", 1, 1_000, inbound_tx);
        let mut events = client.subscribe();
        client.start();

        let event = loop {
            match events.recv().await {
                Ok(ClientEvent::ConnectFailed) => break ClientEvent::ConnectFailed,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        };
        assert_eq!(event, ClientEvent::ConnectFailed);
        assert!(!client.is_started());
        assert!(client.ensure_connected(0).await.is_err());
    }

    #[tokio::test]
    async fn ensure_connected_times_out_without_listener() {
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let client = NetClient::new("waiting", "127.0.0.1:1", -1, 1_000, inbound_tx);
        client.start();
        assert!(matches!(
            client.ensure_connected(100).await,
            Err(StrataError::ConnectTimeout(_))
        ));
        client.shutdown();
    }
}
