//! One physical peer connection.
//!
//! A connection owns the socket's reader and writer tasks, a bounded
//! outbound queue, and the synchronous-request bridge for traffic it
//! initiated. Inbound packets are first offered to the bridge; error
//! packets that nothing is waiting on are logged and dropped; everything
//! else is handed to the inbound channel for the application workers.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use strata_core::{Result, StrataError, MAX_CHUNK_SIZE, MAX_FRAME_SIZE};

use crate::codec;
use crate::packet::Packet;
use crate::sync_rpc::SyncRequestSupport;

const OUTBOUND_QUEUE_SIZE: usize = 256;
const READ_BUFFER_SIZE: usize = 8 * 1024;

/// A packet that survived bridge routing and chunk reassembly, paired
/// with the connection it arrived on so handlers can reply.
pub struct InboundPacket {
    pub packet: Packet,
    pub connection: Arc<Connection>,
}

pub struct Connection {
    name: String,
    peer_addr: SocketAddr,
    outbound: mpsc::Sender<Packet>,
    connected: watch::Sender<bool>,
    sync: Arc<SyncRequestSupport>,
}

impl Connection {
    /// Takes ownership of the stream and spawns the reader and writer
    /// tasks. The connection reports disconnected as soon as either
    /// side of the socket fails.
    pub fn spawn(
        stream: TcpStream,
        name: impl Into<String>,
        inbound: mpsc::Sender<InboundPacket>,
        default_timeout_ms: u64,
    ) -> Arc<Self> {
        let name = name.into();
        let peer_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let (connected_tx, _) = watch::channel(true);
        let sync = SyncRequestSupport::new(name.clone(), default_timeout_ms);

        let connection = Arc::new(Self {
            name,
            peer_addr,
            outbound: outbound_tx,
            connected: connected_tx,
            sync,
        });

        tokio::spawn(Self::read_loop(
            Arc::clone(&connection),
            read_half,
            inbound,
        ));
        tokio::spawn(Self::write_loop(
            Arc::clone(&connection),
            write_half,
            outbound_rx,
        ));
        connection
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn sync_support(&self) -> &Arc<SyncRequestSupport> {
        &self.sync
    }

    /// Resolves once the connection has been torn down.
    pub async fn wait_closed(&self) {
        let mut connected = self.connected.subscribe();
        while *connected.borrow() {
            if connected.changed().await.is_err() {
                return;
            }
        }
    }

    /// Signals both I/O tasks to exit. Pending synchronous requests are
    /// failed by the reader during teardown.
    pub fn close(&self) {
        let _ = self.connected.send_replace(false);
    }

    /// Queues a packet for the writer task. Packets flagged for chunking
    /// are split before queueing so no single frame exceeds the wire
    /// limit.
    pub async fn send(&self, packet: Packet) -> Result<()> {
        if !self.is_connected() {
            return Err(StrataError::Disconnected(format!(
                "connection {} is closed",
                self.name
            )));
        }
        if packet.header.support_chunked() && packet.body.len() > MAX_CHUNK_SIZE {
            for fragment in packet.partition_chunks(true, MAX_CHUNK_SIZE) {
                self.enqueue(fragment).await?;
            }
            return Ok(());
        }
        // Reject before queueing so a synchronous caller fails now
        // instead of waiting out the timeout sweep.
        let frame_len = 4 + packet.header.encoded_len() + 4 + packet.body.len();
        if frame_len > MAX_FRAME_SIZE {
            return Err(StrataError::Protocol(format!(
                "frame of {frame_len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
            )));
        }
        self.enqueue(packet).await
    }

    /// Sends a request and parks until the correlated response arrives,
    /// the timeout sweep expires it, or the connection dies.
    pub async fn send_sync(&self, mut request: Packet) -> Result<Packet> {
        if !self.is_connected() {
            return Err(StrataError::Disconnected(format!(
                "connection {} is closed",
                self.name
            )));
        }
        let receiver = self.sync.register(&mut request).await;
        self.send(request).await?;
        match receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(StrataError::Disconnected(format!(
                "connection {} closed before a response arrived",
                self.name
            ))),
        }
    }

    /// Sends a response correlated to `request`, chunking it when the
    /// requester advertised chunk support.
    pub async fn reply_to(&self, request: &Packet, mut response: Packet) -> Result<()> {
        if let Some(sequence) = request.header.sequence() {
            let sequence = sequence.to_string();
            response.header.set_sequence(&sequence);
        }
        for fragment in
            response.partition_chunks(request.header.support_chunked(), MAX_CHUNK_SIZE)
        {
            self.send(fragment).await?;
        }
        Ok(())
    }

    async fn enqueue(&self, packet: Packet) -> Result<()> {
        self.outbound
            .send(packet)
            .await
            .map_err(|_| StrataError::ChannelClosed("connection outbound queue"))
    }

    async fn read_loop(
        connection: Arc<Connection>,
        mut read_half: OwnedReadHalf,
        inbound: mpsc::Sender<InboundPacket>,
    ) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut closed = connection.connected.subscribe();

        'outer: loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() || !*closed.borrow() {
                        break;
                    }
                }
                read = read_half.read_buf(&mut buf) => {
                    match read {
                        Ok(0) => {
                            debug!(
                                target: "strata::net",
                                connection = %connection.name,
                                peer = %connection.peer_addr,
                                "Peer closed the connection"
                            );
                            break;
                        }
                        Ok(_) => loop {
                            match codec::decode_packet(&mut buf) {
                                Ok(Some(packet)) => {
                                    let delivered =
                                        Self::route_inbound(&connection, packet, &inbound).await;
                                    if !delivered {
                                        break 'outer;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    warn!(
                                        target: "strata::net",
                                        connection = %connection.name,
                                        peer = %connection.peer_addr,
                                        error = %e,
                                        "Dropping connection after frame decode failure"
                                    );
                                    break 'outer;
                                }
                            }
                        },
                        Err(e) => {
                            debug!(
                                target: "strata::net",
                                connection = %connection.name,
                                peer = %connection.peer_addr,
                                error = %e,
                                "Read failed, closing connection"
                            );
                            break;
                        }
                    }
                }
            }
        }

        let _ = connection.connected.send_replace(false);
        connection.sync.fail_all("connection closed").await;
    }

    /// Returns false when the inbound channel is gone and the reader
    /// should stop.
    async fn route_inbound(
        connection: &Arc<Connection>,
        packet: Packet,
        inbound: &mpsc::Sender<InboundPacket>,
    ) -> bool {
        // Responses to our own synchronous requests are consumed by the
        // bridge, chunk reassembly included.
        let packet = match connection.sync.on_response(packet).await {
            Some(packet) => packet,
            None => return true,
        };

        if let Some(message) = packet.error() {
            warn!(
                target: "strata::net",
                connection = %connection.name,
                peer = %connection.peer_addr,
                error = %message,
                "Discarding error packet with no pending request"
            );
            return true;
        }

        inbound
            .send(InboundPacket {
                packet,
                connection: Arc::clone(connection),
            })
            .await
            .is_ok()
    }

    async fn write_loop(
        connection: Arc<Connection>,
        mut write_half: OwnedWriteHalf,
        mut outbound: mpsc::Receiver<Packet>,
    ) {
        let mut buf = BytesMut::with_capacity(READ_BUFFER_SIZE);
        let mut closed = connection.connected.subscribe();

        loop {
            tokio::select! {
                changed = closed.changed() => {
                    if changed.is_err() || !*closed.borrow() {
                        break;
                    }
                }
                next = outbound.recv() => {
                    let Some(packet) = next else { break };
                    buf.clear();
                    if let Err(e) = codec::encode_packet(&packet, &mut buf) {
                        warn!(
                            target: "strata::net",
                            connection = %connection.name,
                            error = %e,
                            "Dropping unencodable outbound packet"
                        );
                        continue;
                    }
                    if let Err(e) = write_half.write_all(&buf).await {
                        debug!(
                            target: "strata::net",
                            connection = %connection.name,
                            peer = %connection.peer_addr,
                            error = %e,
                            "Write failed, closing connection"
                        );
                        break;
                    }
                }
            }
        }

        let _ = connection.connected.send_replace(false);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use bytes::Bytes;
    use tokio::net::TcpListener;

    async fn connected_pair(
        queue: usize,
    ) -> (
        Arc<Connection>,
        mpsc::Receiver<InboundPacket>,
        Arc<Connection>,
        mpsc::Receiver<InboundPacket>,
    ) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (server_tx, server_rx) = mpsc::channel(queue);
        let accept = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            Connection::spawn(stream, "server", server_tx, 2_000)
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let (client_tx, client_rx) = mpsc::channel(queue);
        let client = Connection::spawn(stream, "client", client_tx, 2_000);
        let server = accept.await.unwrap();
        (client, client_rx, server, server_rx)
    }

    #[tokio::test]
    async fn send_delivers_packet_to_remote_handler() {
        let (client, _client_rx, _server, mut server_rx) = connected_pair(16).await;

        let mut packet = Packet::new(PacketType::PeerAware, Bytes::from_static(b"hello"));
        packet.header.set_node_id(7);
        client.send(packet).await.unwrap();

        let inbound = server_rx.recv().await.unwrap();
        assert_eq!(&inbound.packet.body[..], b"hello");
        assert_eq!(inbound.packet.header.node_id(), Some(7));
    }

    #[tokio::test]
    async fn send_sync_round_trip() {
        let (client, _client_rx, _server, mut server_rx) = connected_pair(16).await;

        tokio::spawn(async move {
            while let Some(inbound) = server_rx.recv().await {
                let reply = Packet::new(PacketType::Unknown, Bytes::from_static(b"pong"));
                inbound.connection.reply_to(&inbound.packet, reply).await.unwrap();
            }
        });

        let response = client
            .send_sync(Packet::new(PacketType::Unknown, Bytes::from_static(b"ping")))
            .await
            .unwrap();
        assert_eq!(&response.body[..], b"pong");
    }

    #[tokio::test]
    async fn chunked_response_round_trip() {
        let (client, _client_rx, _server, mut server_rx) = connected_pair(16).await;

        // Bigger than one chunk so the reply must be fragmented.
        let large = vec![0x5A_u8; MAX_CHUNK_SIZE + 1024];
        let expected = large.clone();
        tokio::spawn(async move {
            while let Some(inbound) = server_rx.recv().await {
                let reply = Packet::new(PacketType::Unknown, Bytes::from(large.clone()));
                inbound.connection.reply_to(&inbound.packet, reply).await.unwrap();
            }
        });

        let mut request = Packet::new(PacketType::Unknown, Bytes::from_static(b"pull"));
        request.header.set_support_chunked(true);
        let response = client.send_sync(request).await.unwrap();
        assert_eq!(response.body.len(), expected.len());
        assert_eq!(&response.body[..], &expected[..]);
    }

    #[tokio::test]
    async fn close_fails_pending_requests() {
        let (client, _client_rx, server, _server_rx) = connected_pair(16).await;

        let request = Packet::new(PacketType::Unknown, Bytes::from_static(b"never answered"));
        let pending = tokio::spawn({
            let client = Arc::clone(&client);
            async move { client.send_sync(request).await }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        server.close();

        assert!(matches!(
            pending.await.unwrap(),
            Err(StrataError::Disconnected(_))
        ));
        assert!(!client.is_connected() || client.sync_support().pending_count().await == 0);
    }

    #[tokio::test]
    async fn oversized_unchunked_send_is_rejected() {
        let (client, _client_rx, _server, _server_rx) = connected_pair(16).await;

        // Too big for one frame and not flagged for chunking.
        let body = Bytes::from(vec![0u8; MAX_FRAME_SIZE + 1]);
        let result = client.send(Packet::new(PacketType::Unknown, body)).await;
        assert!(matches!(result, Err(StrataError::Protocol(_))));
        assert!(client.is_connected());
    }

    #[tokio::test]
    async fn send_on_closed_connection_fails_fast() {
        let (client, _client_rx, _server, _server_rx) = connected_pair(16).await;
        client.close();
        client.wait_closed().await;
        assert!(matches!(
            client.send(Packet::new(PacketType::Unknown, Bytes::new())).await,
            Err(StrataError::Disconnected(_))
        ));
    }
}
