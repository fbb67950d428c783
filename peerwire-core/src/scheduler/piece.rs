//! Per-piece download state: which blocks are pending, in flight, or
//! received, and the buffer they accumulate into.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use crate::block::{blocks_for_piece, BlockInfo};

#[derive(Debug, Clone)]
pub enum BlockState {
    Pending,
    /// Requested from one or more peers (more than one only during
    /// endgame). Each entry records when the request was sent, so
    /// timeouts can be detected per peer.
    InFlight(HashMap<SocketAddr, Instant>),
    Received,
}

/// Tracks progress on a single piece: which of its blocks are done and
/// the bytes received so far.
#[derive(Debug, Clone)]
pub struct PieceProgress {
    pub index: u32,
    pub length: u32,
    blocks: Vec<BlockState>,
    buffer: Vec<u8>,
    /// Peers that contributed at least one block to this piece; on a
    /// hash mismatch all of them take a reputation hit.
    pub contributors: Vec<SocketAddr>,
}

impl PieceProgress {
    pub fn new(index: u32, length: u32) -> Self {
        let block_infos = blocks_for_piece(index, length);
        PieceProgress {
            index,
            length,
            blocks: vec![BlockState::Pending; block_infos.len()],
            buffer: vec![0u8; length as usize],
            contributors: Vec::new(),
        }
    }

    pub fn block_infos(&self) -> Vec<BlockInfo> {
        blocks_for_piece(self.index, self.length)
    }

    fn block_index(&self, begin: u32) -> Option<usize> {
        (begin / crate::block::BLOCK_SIZE).try_into().ok()
    }

    pub fn state(&self, begin: u32) -> Option<&BlockState> {
        self.block_index(begin).and_then(|i| self.blocks.get(i))
    }

    pub fn pending_blocks(&self) -> Vec<BlockInfo> {
        self.block_infos()
            .into_iter()
            .enumerate()
            .filter(|(i, _)| matches!(self.blocks[*i], BlockState::Pending))
            .map(|(_, b)| b)
            .collect()
    }

    pub fn in_flight_for_peer(&self, peer: SocketAddr) -> Vec<BlockInfo> {
        self.block_infos()
            .into_iter()
            .enumerate()
            .filter(|(i, _)| matches!(&self.blocks[*i], BlockState::InFlight(peers) if peers.contains_key(&peer)))
            .map(|(_, b)| b)
            .collect()
    }

    pub fn mark_in_flight(&mut self, begin: u32, peer: SocketAddr, now: Instant) {
        let Some(i) = self.block_index(begin) else { return };
        match &mut self.blocks[i] {
            BlockState::InFlight(peers) => {
                peers.insert(peer, now);
            }
            _ => {
                let mut peers = HashMap::new();
                peers.insert(peer, now);
                self.blocks[i] = BlockState::InFlight(peers);
            }
        }
    }

    pub fn mark_pending(&mut self, begin: u32) {
        if let Some(i) = self.block_index(begin) {
            self.blocks[i] = BlockState::Pending;
        }
    }

    /// Removes `peer` from the in-flight set of every block it holds a
    /// slot on, reverting blocks with no remaining holder to pending.
    /// Returns the blocks that reverted.
    pub fn drop_peer(&mut self, peer: SocketAddr) -> Vec<BlockInfo> {
        let infos = self.block_infos();
        let mut reverted = Vec::new();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if let BlockState::InFlight(peers) = block {
                if peers.remove(&peer).is_some() && peers.is_empty() {
                    *block = BlockState::Pending;
                    reverted.push(infos[i]);
                }
            }
        }
        reverted
    }

    /// Records a received block's bytes. Returns `true` if this was the
    /// first arrival for the slot (the caller should write the bytes
    /// in and, for endgame duplicates, cancel the other outstanding
    /// requests); `false` if the slot was already `Received` and this
    /// is a discarded duplicate.
    pub fn receive(&mut self, begin: u32, data: &[u8]) -> bool {
        let Some(i) = self.block_index(begin) else { return false };
        if matches!(self.blocks[i], BlockState::Received) {
            return false;
        }
        let start = begin as usize;
        self.buffer[start..start + data.len()].copy_from_slice(data);
        self.blocks[i] = BlockState::Received;
        true
    }

    /// Other peers holding an in-flight slot on `begin`, to be sent a
    /// `cancel` once the first arrival above resolves it.
    pub fn other_holders(&self, begin: u32, received_from: SocketAddr) -> Vec<SocketAddr> {
        let Some(i) = self.block_index(begin) else { return Vec::new() };
        match &self.blocks[i] {
            BlockState::InFlight(peers) => {
                peers.keys().filter(|&&p| p != received_from).copied().collect()
            }
            _ => Vec::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.blocks.iter().all(|b| matches!(b, BlockState::Received))
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Resets every block to `pending` and clears contributors, used
    /// after a hash mismatch.
    pub fn reset(&mut self) {
        for block in &mut self.blocks {
            *block = BlockState::Pending;
        }
        self.contributors.clear();
    }

    /// Timed-out in-flight slots (requested before `cutoff`), reverted
    /// to pending for each timed-out peer. Returns `(peer, block)` for
    /// every slot that timed out, so callers can mark the peer
    /// unreliable.
    pub fn collect_timeouts(&mut self, cutoff: Instant) -> Vec<(SocketAddr, BlockInfo)> {
        let infos = self.block_infos();
        let mut timed_out = Vec::new();
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if let BlockState::InFlight(peers) = block {
                let expired: Vec<SocketAddr> = peers
                    .iter()
                    .filter(|&(_, &sent)| sent < cutoff)
                    .map(|(&p, _)| p)
                    .collect();
                for peer in &expired {
                    peers.remove(peer);
                    timed_out.push((*peer, infos[i]));
                }
                if peers.is_empty() {
                    *block = BlockState::Pending;
                }
            }
        }
        timed_out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn receive_marks_block_done_once() {
        let mut piece = PieceProgress::new(0, BLOCK_SIZE);
        assert!(piece.receive(0, &vec![1u8; BLOCK_SIZE as usize]));
        assert!(piece.is_complete());
        assert!(!piece.receive(0, &vec![2u8; BLOCK_SIZE as usize]));
    }

    #[test]
    fn drop_peer_reverts_only_its_blocks() {
        let mut piece = PieceProgress::new(0, BLOCK_SIZE * 2);
        let a = addr(1);
        let b = addr(2);
        piece.mark_in_flight(0, a, Instant::now());
        piece.mark_in_flight(BLOCK_SIZE, b, Instant::now());
        let reverted = piece.drop_peer(a);
        assert_eq!(reverted, vec![BlockInfo { piece_index: 0, begin: 0, length: BLOCK_SIZE }]);
        assert!(piece.in_flight_for_peer(b).len() == 1);
    }

    #[test]
    fn endgame_second_holder_is_cancelled_on_first_arrival() {
        let mut piece = PieceProgress::new(0, BLOCK_SIZE);
        let a = addr(1);
        let b = addr(2);
        piece.mark_in_flight(0, a, Instant::now());
        piece.mark_in_flight(0, b, Instant::now());
        let others = piece.other_holders(0, a);
        assert_eq!(others, vec![b]);
    }

    #[test]
    fn reset_clears_all_progress() {
        let mut piece = PieceProgress::new(0, BLOCK_SIZE);
        piece.receive(0, &vec![9u8; BLOCK_SIZE as usize]);
        piece.reset();
        assert!(!piece.is_complete());
        assert!(piece.pending_blocks().len() == 1);
    }
}
