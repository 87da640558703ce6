//! Wire bodies for cluster control messages.

use bytes::{Bytes, BytesMut};

/// Membership announcement exchanged on every new transport and relayed
/// across the mesh so each node learns the full server list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerAware {
    /// Announcing node's ID.
    pub node_id: u32,
    /// Announcing node's own endpoint as `host:port:id`.
    pub server: String,
    /// Expected cluster size as the sender knows it.
    pub num_of_node: u32,
    /// Every endpoint the sender currently knows.
    pub servers: Vec<String>,
    /// True when sent by the dialing side of a fresh transport.
    pub is_client: bool,
}

impl PeerAware {
    /// Serialize announcement to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.extend_from_slice(&self.node_id.to_le_bytes());
        buf.extend_from_slice(&self.num_of_node.to_le_bytes());
        buf.extend_from_slice(&[u8::from(self.is_client)]);
        put_str(&mut buf, &self.server);
        buf.extend_from_slice(&(self.servers.len() as u16).to_le_bytes());
        for server in &self.servers {
            put_str(&mut buf, server);
        }
        buf.freeze()
    }

    /// Deserialize announcement from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let node_id = cursor.u32_le()?;
        let num_of_node = cursor.u32_le()?;
        let is_client = cursor.u8()? != 0;
        let server = cursor.str_u16()?;
        let count = cursor.u16_le()? as usize;
        let mut servers = Vec::with_capacity(count);
        for _ in 0..count {
            servers.push(cursor.str_u16()?);
        }
        Some(Self {
            node_id,
            server,
            num_of_node,
            servers,
            is_client,
        })
    }
}

/// A single round of controller voting. A `force` vote carries the
/// settled controller and overrides tallying on the receiver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerVote {
    /// Node that cast the vote.
    pub voter_id: u32,
    /// Node the voter wants as controller.
    pub controller_id: u32,
    /// Voting round, bumped after each round that fails to converge.
    pub round: u32,
    /// Set on replies from already-converged nodes.
    pub force: bool,
}

impl ControllerVote {
    /// Serialize vote to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(16);
        buf.extend_from_slice(&self.voter_id.to_le_bytes());
        buf.extend_from_slice(&self.controller_id.to_le_bytes());
        buf.extend_from_slice(&self.round.to_le_bytes());
        buf.extend_from_slice(&[u8::from(self.force)]);
        buf.freeze()
    }

    /// Deserialize vote from bytes
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let mut cursor = Cursor { data, pos: 0 };
        let voter_id = cursor.u32_le()?;
        let controller_id = cursor.u32_le()?;
        let round = cursor.u32_le()?;
        let force = cursor.u8()? != 0;
        Some(Self {
            voter_id,
            controller_id,
            round,
            force,
        })
    }
}

fn put_str(buf: &mut BytesMut, value: &str) {
    let bytes = value.as_bytes();
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl Cursor<'_> {
    fn take(&mut self, len: usize) -> Option<&[u8]> {
        let end = self.pos.checked_add(len)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    fn u16_le(&mut self) -> Option<u16> {
        self.take(2).map(|s| u16::from_le_bytes([s[0], s[1]]))
    }

    fn u32_le(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    fn str_u16(&mut self) -> Option<String> {
        let len = self.u16_le()? as usize;
        let bytes = self.take(len)?;
        Some(String::from_utf8_lossy(bytes).to_string())
    }
}
