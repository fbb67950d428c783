//! A packed, byte-oriented piece availability set.
//!
//! Bit `i` lives in byte `i / 8`, and within that byte the most
//! significant bit is piece `8 * byte`, matching the wire form
//! (`BITFIELD` message) where piece 0 is the MSB of byte 0.

use rand::Rng;

use crate::types::PieceIndex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitfield {
    total_pieces: usize,
    inner: Vec<u8>,
    count: usize,
}

impl Bitfield {
    pub fn new(total_pieces: usize) -> Self {
        let num_bytes = total_pieces.div_ceil(8);
        Bitfield {
            total_pieces,
            inner: vec![0u8; num_bytes],
            count: 0,
        }
    }

    /// Builds a bitfield from its packed wire representation.
    ///
    /// Rejects payloads shorter than `total_pieces` bits. Trailing
    /// padding bits that are set are accepted (callers should log this
    /// themselves, since acceptance is reported, not refused).
    pub fn from_bytes(total_pieces: usize, bytes: &[u8]) -> Option<Self> {
        let num_bytes = total_pieces.div_ceil(8);
        if bytes.len() < num_bytes {
            return None;
        }
        let inner = bytes[..num_bytes].to_vec();
        let count = inner.iter().map(|b| b.count_ones() as usize).sum();
        Some(Bitfield {
            total_pieces,
            inner,
            count,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.inner
    }

    pub fn total_pieces(&self) -> usize {
        self.total_pieces
    }

    fn byte_bit(index: usize) -> (usize, u8) {
        (index / 8, 1 << (7 - (index % 8)))
    }

    pub fn has(&self, index: PieceIndex) -> bool {
        if index >= self.total_pieces {
            return false;
        }
        let (byte, bit) = Self::byte_bit(index);
        self.inner[byte] & bit != 0
    }

    pub fn set(&mut self, index: PieceIndex) {
        if index >= self.total_pieces {
            return;
        }
        let (byte, bit) = Self::byte_bit(index);
        if self.inner[byte] & bit == 0 {
            self.inner[byte] |= bit;
            self.count += 1;
        }
    }

    pub fn clear(&mut self, index: PieceIndex) {
        if index >= self.total_pieces {
            return;
        }
        let (byte, bit) = Self::byte_bit(index);
        if self.inner[byte] & bit != 0 {
            self.inner[byte] &= !bit;
            self.count -= 1;
        }
    }

    /// Cardinality of the set, maintained incrementally by `set`/`clear`.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn complete(&self) -> bool {
        self.count == self.total_pieces
    }

    fn zip_bytes<'a>(&'a self, other: &'a Bitfield) -> impl Iterator<Item = (u8, u8)> + 'a {
        assert_eq!(
            self.total_pieces, other.total_pieces,
            "bitfields must share a length to combine"
        );
        self.inner.iter().copied().zip(other.inner.iter().copied())
    }

    fn combine(&self, other: &Bitfield, f: impl Fn(u8, u8) -> u8) -> Bitfield {
        let inner: Vec<u8> = self.zip_bytes(other).map(|(a, b)| f(a, b)).collect();
        let count = inner.iter().map(|b| b.count_ones() as usize).sum();
        Bitfield {
            total_pieces: self.total_pieces,
            inner,
            count,
        }
    }

    pub fn union(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a | b)
    }

    pub fn intersect(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a & b)
    }

    /// Pieces present in `self` but absent from `other`.
    pub fn difference(&self, other: &Bitfield) -> Bitfield {
        self.combine(other, |a, b| a & !b)
    }

    /// The pieces present in `mask` but missing from `self`: `mask \ self`.
    fn missing(&self, mask: &Bitfield) -> Vec<PieceIndex> {
        mask.difference(self)
            .iter_set()
            .collect()
    }

    /// Iterates the set bit indices in ascending order.
    pub fn iter_set(&self) -> impl Iterator<Item = PieceIndex> + '_ {
        (0..self.total_pieces).filter(move |&i| self.has(i))
    }

    /// Samples uniformly from `mask \ self`; `None` if that set is empty.
    pub fn random_missing(&self, mask: &Bitfield, rng: &mut impl Rng) -> Option<PieceIndex> {
        let candidates = self.missing(mask);
        if candidates.is_empty() {
            return None;
        }
        let pick = rng.random_range(0..candidates.len());
        Some(candidates[pick])
    }

    /// Returns the index in `mask \ self` with the lowest `counts[i]`,
    /// breaking ties by lowest index. `counts` must be indexable up to
    /// `total_pieces - 1`.
    pub fn rarest(&self, mask: &Bitfield, counts: &[u32]) -> Option<PieceIndex> {
        self.missing(mask)
            .into_iter()
            .min_by_key(|&i| (counts[i], i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn set_has_clear() {
        let mut bf = Bitfield::new(10);
        assert!(!bf.has(3));
        bf.set(3);
        assert!(bf.has(3));
        assert_eq!(bf.count(), 1);
        bf.clear(3);
        assert!(!bf.has(3));
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn piece_zero_is_msb_of_byte_zero() {
        let mut bf = Bitfield::new(8);
        bf.set(0);
        assert_eq!(bf.as_bytes(), &[0b1000_0000]);
    }

    #[test]
    fn out_of_range_indices_are_noops() {
        let mut bf = Bitfield::new(4);
        bf.set(10);
        assert!(!bf.has(10));
        assert_eq!(bf.count(), 0);
    }

    #[test]
    fn complete_iff_full_cardinality() {
        let mut bf = Bitfield::new(3);
        assert!(!bf.complete());
        bf.set(0);
        bf.set(1);
        bf.set(2);
        assert!(bf.complete());
    }

    #[test]
    fn set_algebra() {
        let mut a = Bitfield::new(4);
        a.set(0);
        a.set(1);
        let mut b = Bitfield::new(4);
        b.set(1);
        b.set(2);

        let u = a.union(&b);
        assert!(u.has(0) && u.has(1) && u.has(2) && !u.has(3));
        assert_eq!(u.count(), 3);

        let i = a.intersect(&b);
        assert!(i.has(1) && !i.has(0) && !i.has(2));
        assert_eq!(i.count(), 1);

        let d = a.difference(&b);
        assert!(d.has(0) && !d.has(1));
        assert_eq!(d.count(), 1);
    }

    #[test]
    fn random_missing_samples_from_mask_minus_self() {
        let mut have = Bitfield::new(4);
        have.set(0);
        let mut mask = Bitfield::new(4);
        mask.set(0);
        mask.set(2);

        let mut rng = StdRng::seed_from_u64(1);
        let pick = have.random_missing(&mask, &mut rng);
        assert_eq!(pick, Some(2));
    }

    #[test]
    fn random_missing_none_when_exhausted() {
        let mut have = Bitfield::new(2);
        have.set(0);
        have.set(1);
        let mask = have.clone();
        let mut rng = StdRng::seed_from_u64(1);
        assert_eq!(have.random_missing(&mask, &mut rng), None);
    }

    #[test]
    fn rarest_breaks_ties_by_lowest_index() {
        let have = Bitfield::new(4);
        let mask = {
            let mut m = Bitfield::new(4);
            m.set(0);
            m.set(1);
            m.set(2);
            m
        };
        let counts = [5, 3, 3, 0];
        assert_eq!(have.rarest(&mask, &counts), Some(1));
    }

    #[test]
    #[should_panic(expected = "must share a length")]
    fn combine_requires_matching_length() {
        let a = Bitfield::new(4);
        let b = Bitfield::new(8);
        let _ = a.union(&b);
    }
}
