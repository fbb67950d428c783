//! Per-connection byte accounting, used for flood detection and, later,
//! throughput reporting.

/// Running totals of bytes exchanged on a connection, broken down by
/// category so the flood predicate can compare protocol chatter
/// against actual payload delivered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Framing bytes: length prefixes, message ids.
    pub overhead: u64,
    /// Non-piece payload: choke/have/bitfield/request bodies, etc.
    pub control: u64,
    /// Piece block bytes.
    pub payload: u64,
}

impl Stats {
    pub fn record(&mut self, overhead: u64, control: u64, payload: u64) {
        self.overhead += overhead;
        self.control += control;
        self.payload += payload;
    }

    /// Total bytes transmitted across all categories.
    pub fn transmitted(&self) -> u64 {
        self.overhead + self.control + self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transmitted_sums_all_categories() {
        let mut stats = Stats::default();
        stats.record(4, 1, 16384);
        assert_eq!(stats.transmitted(), 4 + 1 + 16384);
    }
}
