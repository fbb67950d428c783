//! The binary wire protocol: handshake, message catalog, and the
//! `tokio_util` codec that frames messages off a socket.

pub mod codec;
pub mod handshake;
pub mod message;

pub use codec::{CodecError, MessageCodec};
pub use handshake::{Handshake, HandshakeCodec};
pub use message::Message;
