//! Piece/block coordinate arithmetic.
//!
//! A piece is split into fixed-size blocks (16 KiB, the de facto wire
//! standard), except for a shortened final block when the piece length
//! is not a multiple of the block size.

use bytes::Bytes;

/// The standard request granularity.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// Coordinates identifying a block within a torrent, as sent on the
/// wire in `request`/`cancel` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockInfo {
    pub piece_index: u32,
    pub begin: u32,
    pub length: u32,
}

/// A received block's payload, as carried in a `piece` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub piece_index: u32,
    pub begin: u32,
    pub data: Bytes,
}

impl Block {
    pub fn info(&self) -> BlockInfo {
        BlockInfo {
            piece_index: self.piece_index,
            begin: self.begin,
            length: self.data.len() as u32,
        }
    }
}

/// Number of blocks a piece of `piece_len` bytes is split into.
pub fn block_count(piece_len: u32) -> u32 {
    piece_len.div_ceil(BLOCK_SIZE)
}

/// The `(begin, length)` of the `n`th block (0-indexed) of a piece of
/// `piece_len` bytes. Panics if `n >= block_count(piece_len)`.
pub fn block_range(piece_len: u32, n: u32) -> (u32, u32) {
    assert!(n < block_count(piece_len), "block index out of range");
    let begin = n * BLOCK_SIZE;
    let length = (piece_len - begin).min(BLOCK_SIZE);
    (begin, length)
}

/// All `BlockInfo`s for a piece at `piece_index` of length `piece_len`.
pub fn blocks_for_piece(piece_index: u32, piece_len: u32) -> Vec<BlockInfo> {
    (0..block_count(piece_len))
        .map(|n| {
            let (begin, length) = block_range(piece_len, n);
            BlockInfo {
                piece_index,
                begin,
                length,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_multiple_of_block_size() {
        assert_eq!(block_count(BLOCK_SIZE * 2), 2);
        assert_eq!(block_range(BLOCK_SIZE * 2, 0), (0, BLOCK_SIZE));
        assert_eq!(block_range(BLOCK_SIZE * 2, 1), (BLOCK_SIZE, BLOCK_SIZE));
    }

    #[test]
    fn shortened_last_block() {
        let piece_len = BLOCK_SIZE + 100;
        assert_eq!(block_count(piece_len), 2);
        assert_eq!(block_range(piece_len, 1), (BLOCK_SIZE, 100));
    }

    #[test]
    fn blocks_for_piece_covers_whole_piece() {
        let piece_len = BLOCK_SIZE * 2 + 1;
        let blocks = blocks_for_piece(7, piece_len);
        assert_eq!(blocks.len(), 3);
        let total: u32 = blocks.iter().map(|b| b.length).sum();
        assert_eq!(total, piece_len);
        assert!(blocks.iter().all(|b| b.piece_index == 7));
    }
}
