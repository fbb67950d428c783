//! The post-handshake message catalog.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::block::BlockInfo;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { index: u32 },
    Bitfield(Bytes),
    Request(BlockInfo),
    Piece { index: u32, begin: u32, block: Bytes },
    Cancel(BlockInfo),
    Port(u16),
    /// An extension message: a sub-id assigned by the extended handshake,
    /// followed by a bencoded payload. Unknown sub-ids are preserved
    /// opaquely so higher layers can dispatch them.
    Extended { id: u8, payload: Bytes },
    /// A message id this core does not recognize. Preserved so the
    /// connection can skip it by length without killing the connection,
    /// per the decoder contract.
    Unknown { id: u8, payload: Bytes },
}

pub const ID_CHOKE: u8 = 0;
pub const ID_UNCHOKE: u8 = 1;
pub const ID_INTERESTED: u8 = 2;
pub const ID_NOT_INTERESTED: u8 = 3;
pub const ID_HAVE: u8 = 4;
pub const ID_BITFIELD: u8 = 5;
pub const ID_REQUEST: u8 = 6;
pub const ID_PIECE: u8 = 7;
pub const ID_CANCEL: u8 = 8;
pub const ID_PORT: u8 = 9;
pub const ID_EXTENDED: u8 = 20;

impl Message {
    /// The message id on the wire, or `None` for `KeepAlive` (which has
    /// no id byte at all).
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(ID_CHOKE),
            Message::Unchoke => Some(ID_UNCHOKE),
            Message::Interested => Some(ID_INTERESTED),
            Message::NotInterested => Some(ID_NOT_INTERESTED),
            Message::Have { .. } => Some(ID_HAVE),
            Message::Bitfield(_) => Some(ID_BITFIELD),
            Message::Request(_) => Some(ID_REQUEST),
            Message::Piece { .. } => Some(ID_PIECE),
            Message::Cancel(_) => Some(ID_CANCEL),
            Message::Port(_) => Some(ID_PORT),
            Message::Extended { .. } => Some(ID_EXTENDED),
            Message::Unknown { id, .. } => Some(*id),
        }
    }

    pub(crate) fn write_payload(&self, buf: &mut BytesMut) {
        match self {
            Message::KeepAlive
            | Message::Choke
            | Message::Unchoke
            | Message::Interested
            | Message::NotInterested => {}
            Message::Have { index } => buf.put_u32(*index),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request(b) | Message::Cancel(b) => {
                buf.put_u32(b.piece_index);
                buf.put_u32(b.begin);
                buf.put_u32(b.length);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            Message::Port(port) => buf.put_u16(*port),
            Message::Extended { id, payload } => {
                buf.put_u8(*id);
                buf.put_slice(payload);
            }
            Message::Unknown { payload, .. } => buf.put_slice(payload),
        }
    }

    /// Decodes the payload (everything after the id byte) of a message
    /// with the given `id`. `payload` must be exactly the frame's
    /// payload bytes, minus the id byte.
    pub(crate) fn decode_payload(id: u8, mut payload: Bytes) -> Result<Message, DecodeError> {
        match id {
            ID_CHOKE => expect_empty(payload, Message::Choke),
            ID_UNCHOKE => expect_empty(payload, Message::Unchoke),
            ID_INTERESTED => expect_empty(payload, Message::Interested),
            ID_NOT_INTERESTED => expect_empty(payload, Message::NotInterested),
            ID_HAVE => {
                if payload.len() != 4 {
                    return Err(DecodeError::WrongLength { id, len: payload.len() });
                }
                Ok(Message::Have { index: payload.get_u32() })
            }
            ID_BITFIELD => Ok(Message::Bitfield(payload)),
            ID_REQUEST | ID_CANCEL => {
                if payload.len() != 12 {
                    return Err(DecodeError::WrongLength { id, len: payload.len() });
                }
                let block = BlockInfo {
                    piece_index: payload.get_u32(),
                    begin: payload.get_u32(),
                    length: payload.get_u32(),
                };
                Ok(if id == ID_REQUEST {
                    Message::Request(block)
                } else {
                    Message::Cancel(block)
                })
            }
            ID_PIECE => {
                if payload.len() < 8 {
                    return Err(DecodeError::WrongLength { id, len: payload.len() });
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Ok(Message::Piece { index, begin, block: payload })
            }
            ID_PORT => {
                if payload.len() != 2 {
                    return Err(DecodeError::WrongLength { id, len: payload.len() });
                }
                Ok(Message::Port(payload.get_u16()))
            }
            ID_EXTENDED => {
                if payload.is_empty() {
                    return Err(DecodeError::WrongLength { id, len: 0 });
                }
                let ext_id = payload.get_u8();
                Ok(Message::Extended { id: ext_id, payload })
            }
            other => Ok(Message::Unknown { id: other, payload }),
        }
    }
}

fn expect_empty(payload: Bytes, msg: Message) -> Result<Message, DecodeError> {
    if !payload.is_empty() {
        return Err(DecodeError::WrongLength {
            id: msg.id().expect("control messages always have an id"),
            len: payload.len(),
        });
    }
    Ok(msg)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("message id {id} expects a fixed payload shape, got {len} bytes")]
    WrongLength { id: u8, len: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(msg: Message) {
        let mut buf = BytesMut::new();
        msg.write_payload(&mut buf);
        let id = msg.id();
        let decoded = match id {
            None => Message::KeepAlive,
            Some(id) => Message::decode_payload(id, buf.freeze()).unwrap(),
        };
        assert_eq!(decoded, msg);
    }

    #[test]
    fn control_messages_round_trip() {
        round_trip(Message::KeepAlive);
        round_trip(Message::Choke);
        round_trip(Message::Unchoke);
        round_trip(Message::Interested);
        round_trip(Message::NotInterested);
    }

    #[test]
    fn have_round_trips() {
        round_trip(Message::Have { index: 42 });
    }

    #[test]
    fn request_and_cancel_round_trip() {
        let block = BlockInfo { piece_index: 1, begin: 0, length: 16384 };
        round_trip(Message::Request(block));
        round_trip(Message::Cancel(block));
    }

    #[test]
    fn piece_round_trips() {
        round_trip(Message::Piece {
            index: 3,
            begin: 16384,
            block: Bytes::from_static(b"hello world"),
        });
    }

    #[test]
    fn rejects_wrong_length_for_fixed_shape_ids() {
        let err = Message::decode_payload(ID_HAVE, Bytes::from_static(b"abc"));
        assert_eq!(err, Err(DecodeError::WrongLength { id: ID_HAVE, len: 3 }));
    }

    #[test]
    fn unknown_id_is_preserved_not_rejected() {
        let msg = Message::decode_payload(200, Bytes::from_static(b"???")).unwrap();
        assert_eq!(msg, Message::Unknown { id: 200, payload: Bytes::from_static(b"???") });
    }
}
