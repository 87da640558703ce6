//! Frame codec for the peer wire protocol.
//!
//! Frame layout: `u24 frameLength | u32 headerLen | header | u32 bodyLen | body`,
//! all big-endian. `frameLength` covers everything after itself; frames
//! larger than [`MAX_FRAME_SIZE`] are rejected on both paths.

use bytes::{Buf, BufMut, BytesMut};
use strata_core::{Result, StrataError, MAX_FRAME_SIZE};

use crate::packet::{Packet, PacketHeader};

/// Width of the leading frame-length field.
pub const FRAME_LENGTH_BYTES: usize = 3;

pub fn encode_packet(packet: &Packet, dst: &mut BytesMut) -> Result<()> {
    let header_len = packet.header.encoded_len();
    let frame_len = 4 + header_len + 4 + packet.body.len();
    if frame_len > MAX_FRAME_SIZE {
        return Err(StrataError::Protocol(format!(
            "frame of {frame_len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }

    dst.reserve(FRAME_LENGTH_BYTES + frame_len);
    dst.put_uint(frame_len as u64, FRAME_LENGTH_BYTES);
    dst.put_u32(header_len as u32);
    packet.header.encode(dst);
    dst.put_u32(packet.body.len() as u32);
    dst.put_slice(&packet.body);
    Ok(())
}

/// Incremental decode: returns `Ok(None)` until a full frame is buffered,
/// and consumes exactly one frame per `Ok(Some(_))`. A malformed frame
/// poisons the stream; callers are expected to drop the connection.
pub fn decode_packet(src: &mut BytesMut) -> Result<Option<Packet>> {
    if src.len() < FRAME_LENGTH_BYTES {
        return Ok(None);
    }

    let frame_len = u32::from_be_bytes([0, src[0], src[1], src[2]]) as usize;
    if frame_len > MAX_FRAME_SIZE {
        return Err(StrataError::Protocol(format!(
            "inbound frame of {frame_len} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }
    if src.len() < FRAME_LENGTH_BYTES + frame_len {
        return Ok(None);
    }

    src.advance(FRAME_LENGTH_BYTES);
    let mut frame = src.split_to(frame_len).freeze();

    if frame.remaining() < 4 {
        return Err(StrataError::Protocol("frame too short for header length".to_string()));
    }
    let header_len = frame.get_u32() as usize;
    if frame.remaining() < header_len {
        return Err(StrataError::Protocol("frame too short for header".to_string()));
    }
    let header_bytes = frame.split_to(header_len);
    let header = PacketHeader::decode(&header_bytes)?;

    if frame.remaining() < 4 {
        return Err(StrataError::Protocol("frame too short for body length".to_string()));
    }
    let body_len = frame.get_u32() as usize;
    if frame.remaining() != body_len {
        return Err(StrataError::Protocol(format!(
            "body length {body_len} does not match remaining {} frame bytes",
            frame.remaining()
        )));
    }

    Ok(Some(Packet { header, body: frame }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packet::PacketType;
    use bytes::Bytes;

    fn sample_packet() -> Packet {
        let mut packet = Packet::new(PacketType::PeerAware, Bytes::from_static(b"hello peers"));
        packet.header.set_sequence("node-1-42");
        packet.header.set_node_id(1);
        packet
    }

    #[test]
    fn encode_decode_round_trip() {
        let packet = sample_packet();
        let mut buf = BytesMut::new();
        encode_packet(&packet, &mut buf).unwrap();

        let decoded = decode_packet(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, packet);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let packet = sample_packet();
        let mut encoded = BytesMut::new();
        encode_packet(&packet, &mut encoded).unwrap();

        let mut partial = BytesMut::new();
        for chunk in encoded.chunks(5) {
            let before = partial.len();
            partial.extend_from_slice(chunk);
            if before + chunk.len() < encoded.len() {
                assert!(decode_packet(&mut partial).unwrap().is_none());
            }
        }
        let decoded = decode_packet(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn decode_yields_multiple_frames_from_one_buffer() {
        let first = sample_packet();
        let mut second = Packet::new(PacketType::ControllerVote, Bytes::from_static(b"vote"));
        second.header.set_sequence("node-1-43");

        let mut buf = BytesMut::new();
        encode_packet(&first, &mut buf).unwrap();
        encode_packet(&second, &mut buf).unwrap();

        assert_eq!(decode_packet(&mut buf).unwrap().unwrap(), first);
        assert_eq!(decode_packet(&mut buf).unwrap().unwrap(), second);
        assert!(decode_packet(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_is_rejected_on_encode() {
        let packet = Packet::new(PacketType::Unknown, Bytes::from(vec![0u8; MAX_FRAME_SIZE]));
        let mut buf = BytesMut::new();
        assert!(matches!(
            encode_packet(&packet, &mut buf),
            Err(StrataError::Protocol(_))
        ));
    }

    #[test]
    fn oversized_frame_is_rejected_on_decode() {
        let mut buf = BytesMut::new();
        let bogus = (MAX_FRAME_SIZE + 1) as u32;
        buf.put_uint(bogus as u64, FRAME_LENGTH_BYTES);
        assert!(matches!(
            decode_packet(&mut buf),
            Err(StrataError::Protocol(_))
        ));
    }

    #[test]
    fn corrupt_header_fails_the_frame() {
        let packet = sample_packet();
        let mut buf = BytesMut::new();
        encode_packet(&packet, &mut buf).unwrap();
        // Flip the header entry count to something the frame cannot hold.
        buf[FRAME_LENGTH_BYTES + 4] = 0xFF;
        assert!(decode_packet(&mut buf).is_err());
    }
}
