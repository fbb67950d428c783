//! The download scheduler: a pure-logic engine that turns peer
//! bitfields and received blocks into `Request`/`Cancel` intents.
//!
//! It touches no socket. The session feeds it peer state changes and
//! received bytes; it answers with intents for the session to actually
//! send, and outcomes (`BlockOutcome`) describing what just happened.

pub mod piece;
pub mod request;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::Rng;
use sha1::{Digest, Sha1};

use crate::bitfield::Bitfield;
use crate::block::{block_count, BlockInfo};
use crate::conf::SchedulerConf;
use crate::types::{PieceIndex, Sha1Hash};

pub use piece::{BlockState, PieceProgress};
pub use request::{BlockOutcome, Intent, TimedOutRequest};

struct PeerState {
    bitfield: Bitfield,
    choking_us: bool,
}

pub struct Scheduler {
    piece_hashes: Vec<Sha1Hash>,
    total_length: u64,
    nominal_piece_length: u32,
    our_bitfield: Bitfield,
    counts: Vec<u32>,
    peers: HashMap<SocketAddr, PeerState>,
    pieces_in_progress: HashMap<PieceIndex, PieceProgress>,
    conf: SchedulerConf,
    rng: StdRng,
}

impl Scheduler {
    pub fn new(
        piece_hashes: Vec<Sha1Hash>,
        total_length: u64,
        nominal_piece_length: u32,
        conf: SchedulerConf,
        rng: StdRng,
    ) -> Self {
        let total_pieces = piece_hashes.len();
        Scheduler {
            piece_hashes,
            total_length,
            nominal_piece_length,
            our_bitfield: Bitfield::new(total_pieces),
            counts: vec![0; total_pieces],
            peers: HashMap::new(),
            pieces_in_progress: HashMap::new(),
            conf,
            rng,
        }
    }

    pub fn our_bitfield(&self) -> &Bitfield {
        &self.our_bitfield
    }

    pub fn total_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    pub fn piece_length(&self, index: PieceIndex) -> u32 {
        let is_last = index + 1 == self.piece_hashes.len();
        if is_last {
            let remainder = self.total_length % self.nominal_piece_length as u64;
            if remainder == 0 {
                self.nominal_piece_length
            } else {
                remainder as u32
            }
        } else {
            self.nominal_piece_length
        }
    }

    /// Marks a piece as already held without going through the
    /// request/receive path, for restoring progress from storage at
    /// startup. Any in-progress bookkeeping for the piece is dropped.
    pub fn mark_verified(&mut self, index: PieceIndex) {
        self.our_bitfield.set(index);
        self.pieces_in_progress.remove(&index);
    }

    pub fn register_peer(&mut self, peer: SocketAddr, bitfield: Bitfield) {
        for i in bitfield.iter_set() {
            self.counts[i] += 1;
        }
        self.peers.insert(peer, PeerState { bitfield, choking_us: true });
    }

    pub fn unregister_peer(&mut self, peer: SocketAddr) {
        if let Some(state) = self.peers.remove(&peer) {
            for i in state.bitfield.iter_set() {
                self.counts[i] = self.counts[i].saturating_sub(1);
            }
        }
        for piece in self.pieces_in_progress.values_mut() {
            piece.drop_peer(peer);
        }
    }

    pub fn peer_have(&mut self, peer: SocketAddr, index: PieceIndex) {
        if let Some(state) = self.peers.get_mut(&peer) {
            if !state.bitfield.has(index) {
                state.bitfield.set(index);
                self.counts[index] += 1;
            }
        }
    }

    pub fn set_choking_us(&mut self, peer: SocketAddr, choking: bool) {
        if let Some(state) = self.peers.get_mut(&peer) {
            state.choking_us = choking;
        }
    }

    /// The pieces `peer` has that we neither hold nor have fully
    /// buffered (even if not yet hash-verified).
    fn needed_from(&self, peer: SocketAddr) -> Bitfield {
        let Some(state) = self.peers.get(&peer) else {
            return Bitfield::new(self.total_pieces());
        };
        let mut needed = state.bitfield.difference(&self.our_bitfield);
        for (&index, progress) in &self.pieces_in_progress {
            if progress.is_complete() {
                needed.clear(index);
            }
        }
        needed
    }

    pub fn is_interesting(&self, peer: SocketAddr) -> bool {
        self.needed_from(peer).count() > 0
    }

    fn endgame_active(&self) -> bool {
        let remaining = self.remaining_blocks();
        remaining > 0
            && (remaining < self.peers.len().max(1) || remaining <= self.conf.endgame_block_floor)
    }

    /// Total blocks not yet received across every piece we still need,
    /// whether or not it has started. Used for the endgame predicate.
    fn remaining_blocks(&self) -> usize {
        (0..self.total_pieces())
            .filter(|&i| !self.our_bitfield.has(i))
            .map(|i| match self.pieces_in_progress.get(&i) {
                Some(progress) => {
                    progress.block_infos().len()
                        - progress
                            .block_infos()
                            .iter()
                            .filter(|b| matches!(progress.state(b.begin), Some(BlockState::Received)))
                            .count()
                }
                None => block_count(self.piece_length(i)) as usize,
            })
            .sum()
    }

    fn piece_for(&mut self, index: PieceIndex) -> &mut PieceProgress {
        let length = self.piece_length(index);
        self.pieces_in_progress
            .entry(index)
            .or_insert_with(|| PieceProgress::new(index as u32, length))
    }

    /// Picks the next piece to draw blocks from for `peer`: prefer an
    /// in-progress piece the peer also has with unassigned blocks,
    /// otherwise rarest-first with uniform random tie-break.
    fn select_piece(&mut self, peer: SocketAddr, needed: &Bitfield) -> Option<PieceIndex> {
        if let Some(&index) = self.pieces_in_progress.iter().find_map(|(index, progress)| {
            let peer_has = self.peers.get(&peer).is_some_and(|s| s.bitfield.has(*index));
            if peer_has && needed.has(*index) && !progress.pending_blocks().is_empty() {
                Some(index)
            } else {
                None
            }
        }) {
            return Some(index);
        }

        let candidates: Vec<PieceIndex> = needed.iter_set().collect();
        if candidates.is_empty() {
            return None;
        }
        let min_count = candidates.iter().map(|&i| self.counts[i]).min().unwrap();
        let rarest: Vec<PieceIndex> =
            candidates.into_iter().filter(|&i| self.counts[i] == min_count).collect();
        let pick = self.rng.random_range(0..rarest.len());
        Some(rarest[pick])
    }

    /// Produces up to `window` new `Request` intents for `peer`,
    /// drawing from in-progress pieces first, then new rarest-first
    /// picks, then (if endgame is active) duplicate requests on blocks
    /// already in flight to other peers.
    pub fn next_requests(&mut self, peer: SocketAddr, window: usize) -> Vec<Intent> {
        if window == 0 || self.peers.get(&peer).is_some_and(|s| s.choking_us) {
            return Vec::new();
        }

        let mut intents = Vec::new();
        let needed = self.needed_from(peer);
        if needed.count() == 0 {
            return intents;
        }

        while intents.len() < window {
            let Some(index) = self.select_piece(peer, &needed) else { break };
            let pending = self.piece_for(index).pending_blocks();
            if pending.is_empty() {
                break;
            }
            for block in pending {
                if intents.len() >= window {
                    break;
                }
                self.piece_for(index).mark_in_flight(block.begin, peer, Instant::now());
                intents.push(Intent::Request { peer, block });
            }
        }

        if intents.len() < window && self.endgame_active() {
            let peer_has_bitfield =
                self.peers.get(&peer).map(|s| s.bitfield.clone()).unwrap_or_else(|| Bitfield::new(self.total_pieces()));
            for (&index, progress) in self.pieces_in_progress.iter_mut() {
                if intents.len() >= window {
                    break;
                }
                if !peer_has_bitfield.has(index) {
                    continue;
                }
                for block in progress.block_infos() {
                    if intents.len() >= window {
                        break;
                    }
                    if matches!(progress.state(block.begin), Some(BlockState::InFlight(peers)) if !peers.contains_key(&peer))
                    {
                        progress.mark_in_flight(block.begin, peer, Instant::now());
                        intents.push(Intent::Request { peer, block });
                    }
                }
            }
        }

        intents
    }

    /// Records an arriving block. Returns the outcome plus any `Cancel`
    /// intents the caller must send (endgame duplicates resolved by
    /// this arrival).
    pub fn on_block_received(
        &mut self,
        peer: SocketAddr,
        index: PieceIndex,
        begin: u32,
        data: &[u8],
    ) -> (BlockOutcome, Vec<Intent>) {
        if self.our_bitfield.has(index) {
            return (BlockOutcome::Duplicate, Vec::new());
        }
        let Some(progress) = self.pieces_in_progress.get_mut(&index) else {
            return (BlockOutcome::Duplicate, Vec::new());
        };

        let others = progress.other_holders(begin, peer);
        let first_arrival = progress.receive(begin, data);
        if !first_arrival {
            return (BlockOutcome::Duplicate, Vec::new());
        }
        if !progress.contributors.contains(&peer) {
            progress.contributors.push(peer);
        }

        let cancels = others
            .into_iter()
            .map(|other| Intent::Cancel {
                peer: other,
                block: BlockInfo { piece_index: index as u32, begin, length: data.len() as u32 },
            })
            .collect();

        if !progress.is_complete() {
            return (BlockOutcome::Recorded, cancels);
        }

        let digest = Sha1::digest(progress.buffer());
        let matches = digest.as_slice() == self.piece_hashes[index].as_bytes();
        if matches {
            let data = progress.buffer().to_vec();
            let contributors = progress.contributors.clone();
            self.our_bitfield.set(index);
            self.pieces_in_progress.remove(&index);
            (BlockOutcome::PieceCompleted { index, data, contributors }, cancels)
        } else {
            let penalize = progress.contributors.clone();
            progress.reset();
            (BlockOutcome::PieceInvalid { index, penalize }, cancels)
        }
    }

    /// Request slots outstanding longer than the configured timeout,
    /// reverted to `pending`.
    pub fn check_timeouts(&mut self, now: Instant) -> Vec<TimedOutRequest> {
        let cutoff = now - self.conf.request_timeout;
        self.pieces_in_progress
            .values_mut()
            .flat_map(|p| p.collect_timeouts(cutoff))
            .map(|(peer, block)| TimedOutRequest { peer, block })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCK_SIZE;
    use rand::SeedableRng;

    fn addr(port: u16) -> SocketAddr {
        format!("127.0.0.1:{port}").parse().unwrap()
    }

    fn hash_of(data: &[u8]) -> Sha1Hash {
        let digest = Sha1::digest(data);
        Sha1Hash::try_from(digest.as_slice()).unwrap()
    }

    fn scheduler(piece_len: u32, num_pieces: usize, data: &[u8]) -> Scheduler {
        let hashes: Vec<Sha1Hash> = data
            .chunks(piece_len as usize)
            .map(hash_of)
            .collect();
        assert_eq!(hashes.len(), num_pieces);
        Scheduler::new(
            hashes,
            data.len() as u64,
            piece_len,
            SchedulerConf::new(),
            StdRng::seed_from_u64(7),
        )
    }

    #[test]
    fn single_peer_full_piece_download_and_completion() {
        let data = vec![42u8; BLOCK_SIZE as usize];
        let mut s = scheduler(BLOCK_SIZE, 1, &data);
        let peer = addr(1);
        let mut bf = Bitfield::new(1);
        bf.set(0);
        s.register_peer(peer, bf);
        s.set_choking_us(peer, false);

        assert!(s.is_interesting(peer));
        let intents = s.next_requests(peer, 16);
        assert_eq!(intents.len(), 1);
        let Intent::Request { block, .. } = intents[0] else { panic!() };

        let (outcome, cancels) = s.on_block_received(peer, 0, block.begin, &data);
        assert!(cancels.is_empty());
        assert_eq!(
            outcome,
            BlockOutcome::PieceCompleted { index: 0, data: data.clone(), contributors: vec![peer] }
        );
        assert!(s.our_bitfield().has(0));
    }

    #[test]
    fn hash_mismatch_resets_piece_and_penalizes_contributor() {
        let data = vec![42u8; BLOCK_SIZE as usize];
        let mut s = scheduler(BLOCK_SIZE, 1, &data);
        let peer = addr(1);
        let mut bf = Bitfield::new(1);
        bf.set(0);
        s.register_peer(peer, bf);
        s.set_choking_us(peer, false);
        s.next_requests(peer, 16);

        let corrupt = vec![0u8; BLOCK_SIZE as usize];
        let (outcome, _) = s.on_block_received(peer, 0, 0, &corrupt);
        assert_eq!(outcome, BlockOutcome::PieceInvalid { index: 0, penalize: vec![peer] });
        assert!(!s.our_bitfield().has(0));
        assert_eq!(s.pieces_in_progress.get(&0).unwrap().pending_blocks().len(), 1);
    }

    #[test]
    fn duplicate_block_is_discarded() {
        let data = vec![1u8; BLOCK_SIZE as usize];
        let mut s = scheduler(BLOCK_SIZE, 1, &data);
        let peer = addr(1);
        let mut bf = Bitfield::new(1);
        bf.set(0);
        s.register_peer(peer, bf);
        s.set_choking_us(peer, false);
        s.next_requests(peer, 16);
        s.on_block_received(peer, 0, 0, &data);
        let (outcome, _) = s.on_block_received(peer, 0, 0, &data);
        assert_eq!(outcome, BlockOutcome::Duplicate);
    }

    #[test]
    fn endgame_duplicates_request_and_cancels_loser() {
        let data = vec![9u8; BLOCK_SIZE as usize];
        let mut s = scheduler(BLOCK_SIZE, 1, &data);
        let a = addr(1);
        let b = addr(2);
        let mut bf = Bitfield::new(1);
        bf.set(0);
        s.register_peer(a, bf.clone());
        s.register_peer(b, bf);
        s.set_choking_us(a, false);
        s.set_choking_us(b, false);

        // One block total, two peers: remaining_blocks (1) < peers.len() (2) triggers endgame.
        let intents_a = s.next_requests(a, 16);
        assert_eq!(intents_a.len(), 1);
        let intents_b = s.next_requests(b, 16);
        assert_eq!(intents_b.len(), 1, "endgame should duplicate the outstanding block to b");

        let (outcome, cancels) = s.on_block_received(a, 0, 0, &data);
        assert_eq!(
            outcome,
            BlockOutcome::PieceCompleted { index: 0, data: data.clone(), contributors: vec![a] }
        );
        assert_eq!(cancels, vec![Intent::Cancel {
            peer: b,
            block: BlockInfo { piece_index: 0, begin: 0, length: BLOCK_SIZE },
        }]);
    }

    #[test]
    fn dropping_a_peer_reverts_its_in_flight_blocks() {
        let data = vec![5u8; (BLOCK_SIZE * 2) as usize];
        let mut s = scheduler(BLOCK_SIZE * 2, 1, &data);
        let peer = addr(1);
        let mut bf = Bitfield::new(1);
        bf.set(0);
        s.register_peer(peer, bf);
        s.set_choking_us(peer, false);
        let intents = s.next_requests(peer, 16);
        assert_eq!(intents.len(), 2);

        s.unregister_peer(peer);
        assert_eq!(s.pieces_in_progress.get(&0).unwrap().pending_blocks().len(), 2);
    }
}
