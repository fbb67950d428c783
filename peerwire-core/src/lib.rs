//! The peer-wire exchange subsystem of a BitTorrent client: bitfield
//! and block bookkeeping, a wire codec, a per-peer connection state
//! machine, a download scheduler, and the session/manager layers that
//! tie them into a running swarm.
//!
//! A [`session::Session`] owns one swarm end to end; a
//! [`manager::Manager`] fans inbound sockets out to the right session
//! by info-hash and bounds outbound connection attempts. Callers drive
//! both through cloneable handles rather than touching their internals.

mod bencode;
pub mod bitfield;
pub mod block;
pub mod conf;
pub mod error;
pub mod manager;
pub mod metainfo;
pub mod peer;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod tracker;
pub mod types;
pub mod wire;

pub use conf::Conf;
pub use error::Error;
pub use manager::{Manager, ManagerConf};
pub use metainfo::{Info, Metainfo};
pub use session::{Progress, Session, SessionHandle};
pub use storage::{FileStorage, Storage};
pub use types::{InfoHash, PeerId, PieceIndex, Sha1Hash};
