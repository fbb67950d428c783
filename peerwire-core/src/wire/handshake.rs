//! The fixed-layout handshake exchanged at the start of every connection.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::HandshakeError;
use crate::peer::capabilities::Capabilities;
use crate::types::{InfoHash, PeerId};

pub const PROTOCOL: &str = "BitTorrent protocol";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol: String,
    pub capabilities: Capabilities,
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId, capabilities: Capabilities) -> Self {
        Handshake {
            protocol: PROTOCOL.to_string(),
            capabilities,
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> Bytes {
        let proto = self.protocol.as_bytes();
        let mut buf = BytesMut::with_capacity(49 + proto.len());
        buf.put_u8(proto.len() as u8);
        buf.put_slice(proto);
        buf.put_slice(&self.capabilities.to_bytes());
        buf.put_slice(self.info_hash.as_bytes());
        buf.put_slice(self.peer_id.as_bytes());
        buf.freeze()
    }

    /// Decodes a handshake from `buf`, advancing it past the consumed
    /// bytes. Returns `None` if `buf` does not yet hold a complete
    /// handshake (caller should wait for more bytes).
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Handshake>, HandshakeError> {
        if buf.is_empty() {
            return Ok(None);
        }
        let proto_len = buf[0] as usize;
        let total_len = 1 + proto_len + 8 + 20 + 20;
        if buf.len() < total_len {
            return Ok(None);
        }

        let mut frame = buf.split_to(total_len);
        frame.advance(1);

        let protocol = String::from_utf8(frame.split_to(proto_len).to_vec())
            .map_err(|_| HandshakeError::InvalidProtocol)?;

        let mut reserved = [0u8; 8];
        frame.copy_to_slice(&mut reserved);
        let capabilities = Capabilities::from_bytes(reserved);

        let mut info_hash_bytes = [0u8; 20];
        frame.copy_to_slice(&mut info_hash_bytes);

        let mut peer_id_bytes = [0u8; 20];
        frame.copy_to_slice(&mut peer_id_bytes);

        Ok(Some(Handshake {
            protocol,
            capabilities,
            info_hash: InfoHash::from(info_hash_bytes),
            peer_id: PeerId::from(peer_id_bytes),
        }))
    }
}

/// Frames exactly one [`Handshake`], then is spent: the connection
/// swaps to [`super::codec::MessageCodec`] via `FramedParts`, reusing
/// whatever trailing bytes were already read off the socket.
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = HandshakeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Handshake>, HandshakeError> {
        Handshake::decode(src)
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = HandshakeError;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), HandshakeError> {
        dst.extend_from_slice(&item.encode());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let hs = Handshake::new(
            InfoHash([1; 20]),
            PeerId([2; 20]),
            Capabilities::default().with_dht(),
        );
        let mut encoded = BytesMut::from(&hs.encode()[..]);
        let decoded = Handshake::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, hs);
        assert!(encoded.is_empty());
    }

    #[test]
    fn round_trip_with_nonstandard_protocol_name() {
        let mut hs = Handshake::new(InfoHash([0; 20]), PeerId([0; 20]), Capabilities::default());
        hs.protocol = "x".repeat(255);
        let mut encoded = BytesMut::from(&hs.encode()[..]);
        let decoded = Handshake::decode(&mut encoded).unwrap().unwrap();
        assert_eq!(decoded, hs);
    }

    #[test]
    fn incomplete_buffer_waits_for_more() {
        let hs = Handshake::new(InfoHash([1; 20]), PeerId([2; 20]), Capabilities::default());
        let full = hs.encode();
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(Handshake::decode(&mut partial).unwrap(), None);
    }
}
