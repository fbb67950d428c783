//! Length-prefixed framing for post-handshake messages.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::message::{DecodeError, Message};

/// Frames a peer connection once the handshake has completed. A zero
/// length prefix decodes to [`Message::KeepAlive`].
#[derive(Debug, Default)]
pub struct MessageCodec {
    /// Length of the frame currently being assembled, once known.
    len: Option<u32>,
}

const LENGTH_PREFIX: usize = 4;
/// Refuse to allocate for frames larger than this; guards against a
/// malicious or corrupt length prefix exhausting memory.
const MAX_FRAME_LEN: u32 = 1 << 20; // 1 MiB: far above the largest legal piece block.

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        let len = match self.len {
            Some(len) => len,
            None => {
                if src.len() < LENGTH_PREFIX {
                    return Ok(None);
                }
                let len = (&src[..LENGTH_PREFIX]).get_u32();
                if len > MAX_FRAME_LEN {
                    return Err(CodecError::FrameTooLarge(len));
                }
                src.advance(LENGTH_PREFIX);
                self.len = Some(len);
                len
            }
        };

        if len == 0 {
            self.len = None;
            return Ok(Some(Message::KeepAlive));
        }

        if (src.len() as u32) < len {
            src.reserve((len as usize).saturating_sub(src.len()));
            return Ok(None);
        }

        let mut frame = src.split_to(len as usize).freeze();
        self.len = None;
        let id = frame.get_u8();
        let msg = Message::decode_payload(id, frame)?;
        Ok(Some(msg))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, msg: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let mut payload = BytesMut::new();
        msg.write_payload(&mut payload);
        let id = msg.id();
        let body_len = payload.len() + id.is_some() as usize;
        dst.reserve(LENGTH_PREFIX + body_len);
        dst.put_u32(body_len as u32);
        if let Some(id) = id {
            dst.put_u8(id);
        }
        dst.put_slice(&payload);
        Ok(())
    }
}

/// Convenience for tests and callers that want a single frame without a
/// `Framed` stream.
pub fn encode_message(msg: &Message) -> Bytes {
    let mut codec = MessageCodec::default();
    let mut buf = BytesMut::new();
    Encoder::encode(&mut codec, msg.clone(), &mut buf).expect("in-memory encode cannot fail");
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockInfo;

    fn round_trip(msg: Message) {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn keepalive_is_zero_length() {
        round_trip(Message::KeepAlive);
    }

    #[test]
    fn control_and_data_messages_round_trip() {
        round_trip(Message::Choke);
        round_trip(Message::Have { index: 1 });
        round_trip(Message::Request(BlockInfo { piece_index: 0, begin: 0, length: 16384 }));
        round_trip(Message::Piece { index: 0, begin: 0, block: Bytes::from_static(b"xy") });
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        codec.encode(Message::Have { index: 9 }, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(MAX_FRAME_LEN + 1);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::FrameTooLarge(_))));
    }

    #[test]
    fn unknown_message_id_is_skipped_by_length_not_fatal() {
        let mut codec = MessageCodec::default();
        let mut buf = BytesMut::new();
        buf.put_u32(4);
        buf.put_u8(250);
        buf.put_slice(b"abc");
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::Unknown { id: 250, payload: Bytes::from_static(b"abc") });
    }
}
