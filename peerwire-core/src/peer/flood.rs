//! Pluggable flood detection.
//!
//! Represented as a trait with a single method so the session can swap
//! in a different policy without the connection caring which one it
//! got, per the "dynamic dispatch" design note: favor an interface over
//! inheritance.

use super::stats::Stats;

pub trait FloodDetector: Send + Sync {
    fn is_flooded(&self, stats: &Stats, factor: u32, threshold: u64) -> bool;
}

/// `transmitted > threshold AND factor*(overhead+control) > payload`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFloodDetector;

impl FloodDetector for DefaultFloodDetector {
    fn is_flooded(&self, stats: &Stats, factor: u32, threshold: u64) -> bool {
        stats.transmitted() > threshold
            && u64::from(factor) * (stats.overhead + stats.control) > stats.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trips_only_past_threshold() {
        let detector = DefaultFloodDetector;
        let mut stats = Stats::default();
        stats.record(100, 0, 0);
        assert!(!detector.is_flooded(&stats, 1, 1000));
    }

    #[test]
    fn trips_when_control_dominates_past_threshold() {
        let detector = DefaultFloodDetector;
        let mut stats = Stats::default();
        stats.record(0, 3_000_000, 0);
        assert!(detector.is_flooded(&stats, 1, 2 * 1024 * 1024));
    }

    #[test]
    fn does_not_trip_when_payload_dominates() {
        let detector = DefaultFloodDetector;
        let mut stats = Stats::default();
        stats.record(1000, 1000, 10_000_000);
        assert!(!detector.is_flooded(&stats, 1, 2 * 1024 * 1024));
    }
}
