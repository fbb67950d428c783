//! Intents and outcomes the scheduler exchanges with its caller.
//!
//! The scheduler itself touches no socket: it is driven by feeding it
//! peer bitfields and received blocks, and it answers with `Request`
//! and `Cancel` intents for the caller to actually send.

use std::net::SocketAddr;

use crate::block::BlockInfo;
use crate::types::PieceIndex;

/// A block request or cancellation the caller should send to `peer`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    Request { peer: SocketAddr, block: BlockInfo },
    Cancel { peer: SocketAddr, block: BlockInfo },
}

/// The result of feeding a received block into the scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    /// Recorded; the piece is not yet complete.
    Recorded,
    /// The slot was already filled; this arrival is a no-op.
    Duplicate,
    /// Every block arrived and the SHA-1 matched. `data` is the
    /// assembled piece, for the caller to commit to storage before
    /// broadcasting `have(index)` to every still-connected peer other
    /// than those in `contributors`, which already hold it.
    PieceCompleted { index: PieceIndex, data: Vec<u8>, contributors: Vec<SocketAddr> },
    /// Every block arrived but the SHA-1 did not match. The piece was
    /// reset to pending and `penalize` lists peers that contributed to
    /// the corrupt buffer.
    PieceInvalid { index: PieceIndex, penalize: Vec<SocketAddr> },
}

/// A request slot that has been outstanding too long.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOutRequest {
    pub peer: SocketAddr,
    pub block: BlockInfo,
}
