//! Networking layer for the STRATA metadata cluster.
//!
//! Provides the length-prefixed packet codec, chunked transfer for
//! oversized bodies, the synchronous-request bridge that correlates
//! responses with blocked callers, and the client/server connection
//! endpoints built on top of them.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod client;
pub mod codec;
pub mod connection;
pub mod packet;
pub mod server;
pub mod sync_rpc;

pub use client::{ClientEvent, NetClient};
pub use connection::{Connection, InboundPacket};
pub use packet::{Packet, PacketHeader, PacketType};
pub use server::NetServer;
pub use sync_rpc::SyncRequestSupport;
