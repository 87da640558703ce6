//! TCP accept loop.
//!
//! Each accepted socket becomes a [`Connection`] feeding the shared
//! inbound queue. The server keeps only weak handles so a connection
//! torn down by its own reader does not linger here.

use std::sync::{Arc, Weak};

use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, info, warn};

use strata_core::Result;

use crate::connection::{Connection, InboundPacket};

pub struct NetServer {
    name: String,
    default_timeout_ms: u64,
    inbound: mpsc::Sender<InboundPacket>,
    connections: Mutex<Vec<Weak<Connection>>>,
}

impl NetServer {
    pub fn new(
        name: impl Into<String>,
        default_timeout_ms: u64,
        inbound: mpsc::Sender<InboundPacket>,
    ) -> Self {
        Self {
            name: name.into(),
            default_timeout_ms,
            inbound,
            connections: Mutex::new(Vec::new()),
        }
    }

    /// Accepts connections until the shutdown channel fires, then closes
    /// every transport still alive.
    pub async fn run(
        &self,
        listen_addr: &str,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!(
            target: "strata::net",
            server = %self.name,
            addr = %listen_addr,
            "Listening for peer connections"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer_addr)) => {
                            if let Err(e) = stream.set_nodelay(true) {
                                debug!(target: "strata::net", server = %self.name, error = %e, "set_nodelay failed");
                            }
                            debug!(
                                target: "strata::net",
                                server = %self.name,
                                peer = %peer_addr,
                                "Accepted connection"
                            );
                            let connection = Connection::spawn(
                                stream,
                                format!("{}-{}", self.name, peer_addr),
                                self.inbound.clone(),
                                self.default_timeout_ms,
                            );
                            let mut connections = self.connections.lock().await;
                            connections.retain(|weak| weak.strong_count() > 0);
                            connections.push(Arc::downgrade(&connection));
                        }
                        Err(e) => {
                            warn!(target: "strata::net", server = %self.name, error = %e, "Accept failed");
                        }
                    }
                }
            }
        }

        info!(target: "strata::net", server = %self.name, "Server shutting down");
        let connections = self.connections.lock().await;
        for weak in connections.iter() {
            if let Some(connection) = weak.upgrade() {
                connection.close();
            }
        }
        Ok(())
    }
}
