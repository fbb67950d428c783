//! Tunables for the peer-wire subsystem, with reasonable defaults.

use std::time::Duration;

/// Fixed request granularity; see [`crate::block::BLOCK_SIZE`].
pub use crate::block::BLOCK_SIZE;

/// Configuration shared by every connection and scheduler in a session.
#[derive(Clone, Debug)]
pub struct Conf {
    pub peer: PeerConf,
    pub scheduler: SchedulerConf,

    /// Per-session cap on simultaneously connected peers, inbound and
    /// outbound combined. The manager's global connection cap is
    /// separate and sits above this one.
    pub max_peers: usize,
}

impl Conf {
    pub fn new() -> Self {
        Self {
            peer: PeerConf::default(),
            scheduler: SchedulerConf::default(),
            max_peers: 50,
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection tunables: keepalive cadence, flood thresholds, penalties.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// Send a keepalive after this much silence on our side.
    pub keepalive_interval: Duration,

    /// Drop the connection after this much silence from the peer.
    pub keepalive_timeout: Duration,

    /// Flood predicate multiplier: `flood_factor * (overhead+control) > payload`.
    pub flood_factor: u32,

    /// Flood predicate is only evaluated once this many bytes have been
    /// transmitted in total.
    pub flood_threshold: u64,

    /// Cap on metadata-piece requests per info-piece index per connection.
    pub metadata_factor: u32,
}

impl PeerConf {
    pub fn new() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(90),
            keepalive_timeout: Duration::from_secs(150),
            flood_factor: 1,
            // 2 MiB, per the flood-detection default.
            flood_threshold: 2 * 1024 * 1024,
            metadata_factor: 5,
        }
    }
}

impl Default for PeerConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduler tunables: request windows, timeouts, endgame trigger.
#[derive(Clone, Debug)]
pub struct SchedulerConf {
    /// Per-peer in-flight request window.
    pub request_window: usize,

    /// A request outstanding longer than this reverts to `pending`.
    pub request_timeout: Duration,

    /// Endgame triggers when unrequested blocks across all
    /// pieces-in-progress drop below `connected_peer_count`, or this
    /// fixed floor, whichever is reached first.
    pub endgame_block_floor: usize,

    /// Default `numwant` sent to the tracker.
    pub numwant_default: u32,

    /// Upper bound on `numwant`, regardless of caller request.
    pub numwant_cap: u32,
}

impl SchedulerConf {
    pub fn new() -> Self {
        Self {
            request_window: 16,
            request_timeout: Duration::from_secs(60),
            endgame_block_floor: 0,
            numwant_default: 50,
            numwant_cap: 200,
        }
    }
}

impl Default for SchedulerConf {
    fn default() -> Self {
        Self::new()
    }
}
