//! The handshake's 8-byte reserved field, interpreted as a 64-bit
//! capability bitset.
//!
//! Bits are numbered from the LSB end of the field taken as a whole
//! (i.e. as if the 8 bytes were a big-endian `u64`). Only the three
//! bits this core negotiates have named accessors; everything else
//! round-trips unexamined.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(pub u64);

/// DHT support (BEP 5).
const DHT_BIT: u32 = 0;
/// Fast extension (BEP 6).
const FAST_BIT: u32 = 2;
/// Extended messaging (BEP 10).
const EXTENDED_BIT: u32 = 20;

impl Capabilities {
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Capabilities(u64::from_be_bytes(bytes))
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    fn has_bit(self, bit: u32) -> bool {
        self.0 & (1 << bit) != 0
    }

    pub fn dht(self) -> bool {
        self.has_bit(DHT_BIT)
    }

    pub fn fast(self) -> bool {
        self.has_bit(FAST_BIT)
    }

    pub fn extended(self) -> bool {
        self.has_bit(EXTENDED_BIT)
    }

    pub fn with_dht(mut self) -> Self {
        self.0 |= 1 << DHT_BIT;
        self
    }

    pub fn with_fast(mut self) -> Self {
        self.0 |= 1 << FAST_BIT;
        self
    }

    pub fn with_extended(mut self) -> Self {
        self.0 |= 1 << EXTENDED_BIT;
        self
    }

    /// The capabilities both sides actually support: bitwise AND.
    pub fn effective(self, other: Capabilities) -> Capabilities {
        Capabilities(self.0 & other.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_bits_round_trip() {
        let caps = Capabilities::default().with_dht().with_fast().with_extended();
        let bytes = caps.to_bytes();
        let back = Capabilities::from_bytes(bytes);
        assert!(back.dht());
        assert!(back.fast());
        assert!(back.extended());
    }

    #[test]
    fn effective_is_bitwise_and() {
        let ours = Capabilities::default().with_dht().with_extended();
        let theirs = Capabilities::default().with_extended();
        let eff = ours.effective(theirs);
        assert!(eff.extended());
        assert!(!eff.dht());
    }

    #[test]
    fn matches_real_wire_byte_layout() {
        // DHT is the LSB of the last reserved byte; extended messaging
        // is bit 0x10 of the sixth byte (index 5, 0-based).
        let caps = Capabilities::default().with_dht().with_extended();
        let bytes = caps.to_bytes();
        assert_eq!(bytes[7] & 0x01, 0x01);
        assert_eq!(bytes[5] & 0x10, 0x10);
    }
}
