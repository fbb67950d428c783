//! Per-peer connection setup and the running state machine.

pub mod capabilities;
pub mod connection;
pub mod flood;
pub mod stats;

pub use capabilities::Capabilities;
pub use connection::{ChokeInterestState, Connection, PeerCommand, PeerEvent};
pub use flood::{DefaultFloodDetector, FloodDetector};
pub use stats::Stats;
