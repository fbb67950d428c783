//! Error kinds for the peer-wire subsystem, split by concern.
//!
//! Connection-local errors (handshake, protocol, liveness) never kill a
//! session: the session logs them, applies [`PeerError::penalty`] to the
//! peer's reputation, and tears down just that connection.

use thiserror::Error;

use crate::types::InfoHash;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("peer sent an unrecognized protocol string")]
    InvalidProtocol,
    #[error("peer's protocol string did not match ours")]
    UnexpectedProtocol,
    #[error("peer's info-hash did not match the expected swarm")]
    UnexpectedTopic,
    #[error("peer-id did not match the one we expected")]
    UnexpectedPeerId,
    #[error("no session is listening for info-hash {0}")]
    UnknownTopic(InfoHash),
    #[error("peer refused to complete the handshake sequence")]
    HandshakeRefused,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("peer sent a second bitfield message")]
    BitfieldAlreadySent,
    #[error("message {0} is not permitted by the negotiated capabilities")]
    DisallowedMessage(&'static str),
    #[error("frame could not be decoded: {0}")]
    DecodingError(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LivenessError {
    #[error("peer disconnected or went silent past the keepalive timeout")]
    PeerDisconnected,
    #[error("peer exceeded the flood threshold")]
    FloodDetected,
}

/// The unified error surface of a single peer connection.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Liveness(#[from] LivenessError),
    /// Raised by a higher layer (session, caller) to request a close;
    /// never raised by the connection itself.
    #[error("caller requested disconnect")]
    DisconnectPeer,
}

impl PeerError {
    /// The reputation penalty callers should apply to the peer on this
    /// error: 1 for spec violations, 0 for `UnknownTopic` and graceful
    /// disconnects.
    pub fn penalty(&self) -> u8 {
        match self {
            PeerError::Handshake(HandshakeError::UnknownTopic(_)) => 0,
            PeerError::Liveness(LivenessError::PeerDisconnected) => 0,
            PeerError::DisconnectPeer => 0,
            PeerError::Handshake(_) => 1,
            PeerError::Protocol(_) => 1,
            PeerError::Liveness(LivenessError::FloodDetected) => 1,
        }
    }
}

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("piece {0} hash mismatch")]
    HashMismatch(u32),
    #[error("no such block in flight for piece {piece}, begin {begin}")]
    UnknownBlock { piece: u32, begin: u32 },
}

/// Top-level error surface for session/storage/tracker boundaries.
#[derive(Debug, Error)]
pub enum Error {
    #[error("storage unreachable: {0}")]
    Storage(#[from] std::io::Error),
    #[error("tracker request failed: {0}")]
    Tracker(String),
    #[error(transparent)]
    Peer(#[from] PeerError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn penalties_match_spec() {
        assert_eq!(
            PeerError::Handshake(HandshakeError::UnknownTopic(InfoHash([0; 20]))).penalty(),
            0
        );
        assert_eq!(
            PeerError::Liveness(LivenessError::PeerDisconnected).penalty(),
            0
        );
        assert_eq!(
            PeerError::Protocol(ProtocolError::BitfieldAlreadySent).penalty(),
            1
        );
        assert_eq!(
            PeerError::Liveness(LivenessError::FloodDetected).penalty(),
            1
        );
    }
}
