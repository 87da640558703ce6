//! Wire packet model.
//!
//! A packet is a string-map header plus an opaque body. The header keys
//! this core understands are exposed through typed accessors; unknown
//! keys round-trip untouched so newer peers can add fields without
//! breaking older ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use strata_core::{Result, StrataError};

pub const HEADER_SEQUENCE: &str = "sequence";
pub const HEADER_PACKET_TYPE: &str = "packetType";
pub const HEADER_NODE_ID: &str = "nodeId";
pub const HEADER_ERROR: &str = "error";
pub const HEADER_BROADCAST: &str = "broadcast";
pub const HEADER_ACK: &str = "ack";
pub const HEADER_TIMEOUT_MS: &str = "timeoutInMs";
pub const HEADER_SUPPORT_CHUNKED: &str = "supportChunked";
pub const HEADER_USERNAME: &str = "username";
pub const HEADER_USER_TOKEN: &str = "userToken";

/// Message schema selector carried in the `packetType` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketType {
    #[default]
    Unknown,
    PeerAware,
    ControllerVote,
}

impl PacketType {
    pub fn code(self) -> u32 {
        match self {
            PacketType::Unknown => 0,
            PacketType::PeerAware => 1,
            PacketType::ControllerVote => 2,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            1 => PacketType::PeerAware,
            2 => PacketType::ControllerVote,
            _ => PacketType::Unknown,
        }
    }
}

/// Typed view over the string-map packet header.
///
/// Backed by an ordered map so the wire encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PacketHeader {
    fields: BTreeMap<String, String>,
}

impl PacketHeader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.fields.insert(key.to_string(), value.into());
    }

    pub fn sequence(&self) -> Option<&str> {
        self.get(HEADER_SEQUENCE)
    }

    pub fn set_sequence(&mut self, sequence: &str) {
        self.set(HEADER_SEQUENCE, sequence);
    }

    pub fn packet_type(&self) -> PacketType {
        self.get(HEADER_PACKET_TYPE)
            .and_then(|raw| raw.parse::<u32>().ok())
            .map(PacketType::from_code)
            .unwrap_or_default()
    }

    pub fn set_packet_type(&mut self, packet_type: PacketType) {
        self.set(HEADER_PACKET_TYPE, packet_type.code().to_string());
    }

    pub fn node_id(&self) -> Option<u32> {
        self.get(HEADER_NODE_ID).and_then(|raw| raw.parse().ok())
    }

    pub fn set_node_id(&mut self, node_id: u32) {
        self.set(HEADER_NODE_ID, node_id.to_string());
    }

    pub fn error(&self) -> Option<&str> {
        self.get(HEADER_ERROR)
    }

    pub fn set_error(&mut self, message: &str) {
        self.set(HEADER_ERROR, message);
    }

    pub fn is_error(&self) -> bool {
        self.error().is_some()
    }

    pub fn broadcast(&self) -> bool {
        self.get(HEADER_BROADCAST).is_some_and(|raw| raw == "true")
    }

    pub fn set_broadcast(&mut self, broadcast: bool) {
        self.set(HEADER_BROADCAST, broadcast.to_string());
    }

    pub fn ack(&self) -> u32 {
        self.get(HEADER_ACK)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_ack(&mut self, ack: u32) {
        self.set(HEADER_ACK, ack.to_string());
    }

    /// Per-request deadline in milliseconds. Zero means "use the bridge
    /// default"; a negative value disables the timeout sweep entirely.
    pub fn timeout_ms(&self) -> i64 {
        self.get(HEADER_TIMEOUT_MS)
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: i64) {
        self.set(HEADER_TIMEOUT_MS, timeout_ms.to_string());
    }

    pub fn support_chunked(&self) -> bool {
        self.get(HEADER_SUPPORT_CHUNKED)
            .is_some_and(|raw| raw == "true")
    }

    pub fn set_support_chunked(&mut self, support_chunked: bool) {
        self.set(HEADER_SUPPORT_CHUNKED, support_chunked.to_string());
    }

    pub fn username(&self) -> Option<&str> {
        self.get(HEADER_USERNAME)
    }

    pub fn user_token(&self) -> Option<&str> {
        self.get(HEADER_USER_TOKEN)
    }

    pub fn encoded_len(&self) -> usize {
        4 + self
            .fields
            .iter()
            .map(|(key, value)| 2 + key.len() + 4 + value.len())
            .sum::<usize>()
    }

    /// Encoding: `u32 entry count`, then per entry
    /// `u16 key length | key | u32 value length | value`, big-endian.
    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_u32(self.fields.len() as u32);
        for (key, value) in &self.fields {
            dst.put_u16(key.len() as u16);
            dst.put_slice(key.as_bytes());
            dst.put_u32(value.len() as u32);
            dst.put_slice(value.as_bytes());
        }
    }

    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.remaining() < 4 {
            return Err(StrataError::Protocol("truncated header block".to_string()));
        }
        let count = buf.get_u32();
        let mut fields = BTreeMap::new();
        for _ in 0..count {
            if buf.remaining() < 2 {
                return Err(StrataError::Protocol("truncated header key length".to_string()));
            }
            let key_len = buf.get_u16() as usize;
            if buf.remaining() < key_len {
                return Err(StrataError::Protocol("truncated header key".to_string()));
            }
            let key = std::str::from_utf8(&buf[..key_len])
                .map_err(|_| StrataError::InvalidData("header key is not UTF-8".to_string()))?
                .to_string();
            buf.advance(key_len);

            if buf.remaining() < 4 {
                return Err(StrataError::Protocol("truncated header value length".to_string()));
            }
            let value_len = buf.get_u32() as usize;
            if buf.remaining() < value_len {
                return Err(StrataError::Protocol("truncated header value".to_string()));
            }
            let value = std::str::from_utf8(&buf[..value_len])
                .map_err(|_| StrataError::InvalidData("header value is not UTF-8".to_string()))?
                .to_string();
            buf.advance(value_len);

            fields.insert(key, value);
        }
        if buf.has_remaining() {
            return Err(StrataError::Protocol(format!(
                "{} trailing bytes after header entries",
                buf.remaining()
            )));
        }
        Ok(Self { fields })
    }
}

/// One wire message: header map plus opaque body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub body: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, body: Bytes) -> Self {
        let mut header = PacketHeader::new();
        header.set_packet_type(packet_type);
        Self { header, body }
    }

    pub fn error_response(packet_type: PacketType, message: &str) -> Self {
        let mut packet = Self::new(packet_type, Bytes::new());
        packet.header.set_error(message);
        packet
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type()
    }

    pub fn is_error(&self) -> bool {
        self.header.is_error()
    }

    pub fn error(&self) -> Option<&str> {
        self.header.error()
    }

    /// A chunked fragment with an empty body terminates a chunk sequence.
    pub fn is_chunk_end(&self) -> bool {
        self.header.support_chunked() && self.body.is_empty()
    }

    /// Splits the body into fragments of at most `max_size` bytes, each
    /// flagged `supportChunked`, followed by one terminal empty fragment.
    /// Returns the packet unchanged as a single element when chunking is
    /// disabled or the body already fits.
    pub fn partition_chunks(&self, support_chunked: bool, max_size: usize) -> Vec<Packet> {
        if !support_chunked || self.body.len() <= max_size {
            return vec![self.clone()];
        }

        let mut fragments = Vec::with_capacity(self.body.len() / max_size + 2);
        let mut offset = 0;
        while offset < self.body.len() {
            let end = usize::min(offset + max_size, self.body.len());
            let mut header = self.header.clone();
            header.set_support_chunked(true);
            fragments.push(Packet {
                header,
                body: self.body.slice(offset..end),
            });
            offset = end;
        }

        let mut terminal_header = self.header.clone();
        terminal_header.set_support_chunked(true);
        fragments.push(Packet {
            header: terminal_header,
            body: Bytes::new(),
        });
        fragments
    }

    /// Appends another fragment's body after this packet's body.
    /// Allocates a fresh buffer; used only during reassembly.
    pub fn merge_chunked_body(&mut self, other: &Packet) {
        let mut merged = BytesMut::with_capacity(self.body.len() + other.body.len());
        merged.put_slice(&self.body);
        merged.put_slice(&other.body);
        self.body = merged.freeze();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn header_defaults() {
        let header = PacketHeader::new();
        assert_eq!(header.packet_type(), PacketType::Unknown);
        assert_eq!(header.node_id(), None);
        assert_eq!(header.timeout_ms(), 0);
        assert_eq!(header.ack(), 0);
        assert!(!header.broadcast());
        assert!(!header.support_chunked());
        assert!(!header.is_error());
    }

    #[test]
    fn header_round_trip_preserves_unknown_keys() {
        let mut header = PacketHeader::new();
        header.set_packet_type(PacketType::ControllerVote);
        header.set_sequence("peer-2-17");
        header.set_node_id(3);
        header.set_timeout_ms(-1);
        header.set("x-future-field", "opaque");

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), header.encoded_len());

        let decoded = PacketHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.get("x-future-field"), Some("opaque"));
        assert_eq!(decoded.timeout_ms(), -1);
    }

    #[test]
    fn header_decode_rejects_truncation() {
        let mut header = PacketHeader::new();
        header.set_sequence("a-1");
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        let short = &buf[..buf.len() - 1];
        assert!(PacketHeader::decode(short).is_err());
    }

    #[test]
    fn packet_type_codes() {
        assert_eq!(PacketType::from_code(1), PacketType::PeerAware);
        assert_eq!(PacketType::from_code(2), PacketType::ControllerVote);
        assert_eq!(PacketType::from_code(99), PacketType::Unknown);
        assert_eq!(PacketType::ControllerVote.code(), 2);
    }

    #[test]
    fn partition_passthrough_when_disabled_or_small() {
        let packet = Packet::new(PacketType::Unknown, Bytes::from(vec![7u8; 100]));

        let disabled = packet.partition_chunks(false, 10);
        assert_eq!(disabled.len(), 1);
        assert_eq!(disabled[0], packet);

        let small = packet.partition_chunks(true, 100);
        assert_eq!(small.len(), 1);
        assert_eq!(small[0], packet);
    }

    #[test]
    fn partition_fragment_count_and_reassembly() {
        // 250 bytes over 100-byte chunks: 3 data fragments + terminal marker.
        let body: Vec<u8> = (0..250u32).map(|i| (i % 251) as u8).collect();
        let packet = Packet::new(PacketType::PeerAware, Bytes::from(body));

        let fragments = packet.partition_chunks(true, 100);
        assert_eq!(fragments.len(), 4);
        assert!(fragments.iter().all(|f| f.header.support_chunked()));
        assert!(fragments[3].is_chunk_end());

        let mut assembled = fragments[0].clone();
        for fragment in &fragments[1..3] {
            assembled.merge_chunked_body(fragment);
        }
        assert_eq!(assembled.body, packet.body);
    }

    #[test]
    fn error_packet_is_terminal() {
        let packet = Packet::error_response(PacketType::ControllerVote, "vote rejected");
        assert!(packet.is_error());
        assert_eq!(packet.error(), Some("vote rejected"));
    }
}
