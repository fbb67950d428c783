//! The per-swarm coordinator: owns the scheduler, the connection
//! registry, and (optionally) the tracker loop that keeps the swarm
//! populated with peers.
//!
//! A `Session` runs as its own task, driven by a single `tokio::select!`
//! loop (`Session::run`) so the scheduler's state — the our-bitfield,
//! the piece-rarity histogram, pieces-in-progress — is mutated from one
//! place only, per the "shared state and its discipline" design note.
//! Callers interact with it through a cloneable [`SessionHandle`]; the
//! handle only ever posts commands, it never touches scheduler state
//! directly.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tracing::{debug, info, warn};

use crate::bitfield::Bitfield;
use crate::block::BlockInfo;
use crate::conf::Conf;
use crate::error::Error;
use crate::metainfo::Metainfo;
use crate::peer::{
    Capabilities, Connection, DefaultFloodDetector, FloodDetector, PeerCommand, PeerEvent,
};
use crate::scheduler::{BlockOutcome, Intent, Scheduler};
use crate::storage::Storage;
use crate::tracker::{self, AnnounceRequest, Event as TrackerEvent, TrackerClient};
use crate::types::{InfoHash, PeerId};

/// Bytes downloaded/uploaded/remaining, per §4.5's `progress()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
}

enum SessionCommand {
    Connect(SocketAddr, oneshot::Sender<Result<(), Error>>),
    Adopt(Box<Connection>),
    Progress(oneshot::Sender<Progress>),
    ConnectionCount(oneshot::Sender<usize>),
    Stop(oneshot::Sender<()>),
}

/// A cheap, cloneable reference to a running session.
#[derive(Clone)]
pub struct SessionHandle {
    info_hash: InfoHash,
    commands_tx: mpsc::Sender<SessionCommand>,
    events_tx: mpsc::Sender<(SocketAddr, PeerEvent)>,
}

impl SessionHandle {
    pub fn info_hash(&self) -> InfoHash {
        self.info_hash
    }

    /// The sender a `Connection` should be built against so its events
    /// land in this session's event loop. Used by the manager when
    /// adopting an inbound connection that already resolved to this
    /// session by info-hash.
    pub fn events_tx(&self) -> mpsc::Sender<(SocketAddr, PeerEvent)> {
        self.events_tx.clone()
    }

    /// Opens an outbound connection to `addr` and hands it to a new
    /// peer task bound to this session.
    pub async fn connect(&self, addr: SocketAddr) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.commands_tx
            .send(SessionCommand::Connect(addr, tx))
            .await
            .map_err(|_| Error::Tracker("session has stopped".into()))?;
        rx.await.map_err(|_| Error::Tracker("session has stopped".into()))?
    }

    /// Adopts an inbound connection whose handshake has already
    /// resolved to this session's info-hash (built via
    /// `Connection::accept_inbound` with `events_tx()` as the resolved
    /// sender).
    pub async fn adopt(&self, connection: Connection) {
        let _ = self.commands_tx.send(SessionCommand::Adopt(Box::new(connection))).await;
    }

    pub async fn progress(&self) -> Result<Progress, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands_tx
            .send(SessionCommand::Progress(tx))
            .await
            .map_err(|_| Error::Tracker("session has stopped".into()))?;
        rx.await.map_err(|_| Error::Tracker("session has stopped".into()))
    }

    /// Live count of this session's currently registered connections.
    /// Used by `Manager` to enforce the global connection cap against
    /// actual peer counts rather than a separately tracked tally.
    pub async fn connection_count(&self) -> Result<usize, Error> {
        let (tx, rx) = oneshot::channel();
        self.commands_tx
            .send(SessionCommand::ConnectionCount(tx))
            .await
            .map_err(|_| Error::Tracker("session has stopped".into()))?;
        rx.await.map_err(|_| Error::Tracker("session has stopped".into()))
    }

    /// Gracefully closes all connections and persists the bitfield by
    /// leaving already-written pieces on storage as-is.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        let _ = self.commands_tx.send(SessionCommand::Stop(tx)).await;
        let _ = rx.await;
    }
}

struct PeerSlot {
    commands_tx: mpsc::Sender<PeerCommand>,
    capabilities: Capabilities,
    /// Whether we are currently choking this peer. New connections
    /// start choking, per the wire protocol's default state.
    am_choking: bool,
}

pub struct Session {
    info_hash: InfoHash,
    our_peer_id: PeerId,
    our_capabilities: Capabilities,
    metainfo: Arc<Metainfo>,
    scheduler: Scheduler,
    storage: Arc<dyn Storage>,
    conf: Conf,
    flood: Arc<dyn FloodDetector>,
    connections: HashMap<SocketAddr, PeerSlot>,
    events_tx: mpsc::Sender<(SocketAddr, PeerEvent)>,
    events_rx: mpsc::Receiver<(SocketAddr, PeerEvent)>,
    commands_rx: mpsc::Receiver<SessionCommand>,
    tracker: Option<TrackerClient>,
    announce_interval: Duration,
    uploaded: u64,
    completed_announced: bool,
}

const EVENT_CHANNEL_CAPACITY: usize = 256;
const COMMAND_CHANNEL_CAPACITY: usize = 32;
const PEER_COMMAND_CHANNEL_CAPACITY: usize = 64;
const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(30 * 60);

impl Session {
    /// Builds a session for one swarm, not yet running. `our_capabilities`
    /// is what we advertise in every handshake this session performs.
    pub fn new(
        our_peer_id: PeerId,
        our_capabilities: Capabilities,
        metainfo: Arc<Metainfo>,
        storage: Arc<dyn Storage>,
        conf: Conf,
    ) -> (Session, SessionHandle) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        let scheduler = Scheduler::new(
            metainfo.info.pieces.clone(),
            metainfo.info.length as u64,
            metainfo.info.piece_length as u32,
            conf.scheduler.clone(),
            StdRng::from_os_rng(),
        );

        let tracker = if metainfo.announce.is_empty() {
            None
        } else {
            Some(TrackerClient::new(metainfo.announce.clone()))
        };

        let info_hash = metainfo.info_hash;
        let session = Session {
            info_hash,
            our_peer_id,
            our_capabilities,
            metainfo,
            scheduler,
            storage,
            conf,
            flood: Arc::new(DefaultFloodDetector),
            connections: HashMap::new(),
            events_tx: events_tx.clone(),
            events_rx,
            commands_rx,
            tracker,
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            uploaded: 0,
            completed_announced: false,
        };
        let handle = SessionHandle { info_hash, commands_tx, events_tx };
        (session, handle)
    }

    /// Loads our-bitfield from storage by verifying every piece, then
    /// runs the session's event loop until `stop()` is called.
    pub async fn start(mut self) {
        self.restore_bitfield_from_storage().await;
        self.announce(TrackerEvent::Started).await;

        let mut announce_tick = time::interval(self.announce_interval);
        announce_tick.tick().await; // the Started announce above covers tick zero
        let mut timeout_tick = time::interval(self.conf.scheduler.request_timeout);

        loop {
            tokio::select! {
                cmd = self.commands_rx.recv() => {
                    match cmd {
                        Some(SessionCommand::Stop(ack)) => {
                            self.shutdown().await;
                            let _ = ack.send(());
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    }
                }
                event = self.events_rx.recv() => {
                    match event {
                        Some((addr, event)) => self.handle_event(addr, event).await,
                        None => {}
                    }
                }
                _ = timeout_tick.tick() => self.handle_timeouts().await,
                _ = announce_tick.tick() => self.announce(TrackerEvent::Empty).await,
            }
        }
    }

    async fn restore_bitfield_from_storage(&mut self) {
        for index in 0..self.scheduler.total_pieces() {
            match self.storage.verify_piece(index, &self.metainfo.info.pieces[index]).await {
                Ok(true) => self.scheduler.mark_verified(index),
                Ok(false) => {}
                Err(e) => warn!(%e, index, "failed to verify piece at startup"),
            }
        }
        info!(
            have = self.scheduler.our_bitfield().count(),
            total = self.scheduler.total_pieces(),
            "restored bitfield from storage"
        );
    }

    async fn handle_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Connect(addr, ack) => {
                let result = self.connect(addr).await;
                let _ = ack.send(result);
            }
            SessionCommand::Adopt(connection) => {
                self.register_connection(*connection).await;
            }
            SessionCommand::Progress(ack) => {
                let _ = ack.send(self.progress());
            }
            SessionCommand::ConnectionCount(ack) => {
                let _ = ack.send(self.connections.len());
            }
            SessionCommand::Stop(ack) => {
                // Handled by the caller loop so it can break out; kept
                // here only so the match stays exhaustive if reordered.
                self.shutdown().await;
                let _ = ack.send(());
            }
        }
    }

    async fn connect(&mut self, addr: SocketAddr) -> Result<(), Error> {
        if self.connections.len() >= self.conf.max_peers {
            return Err(Error::Tracker("session is at its peer limit".into()));
        }
        let conn = Connection::connect_outbound(
            addr,
            self.info_hash,
            self.our_peer_id,
            self.our_capabilities,
            None,
            self.flood.clone(),
            self.conf.peer.clone(),
            self.events_tx.clone(),
        )
        .await
        .map_err(Error::from)?;

        let (commands_tx, commands_rx) = mpsc::channel(PEER_COMMAND_CHANNEL_CAPACITY);
        self.connections.insert(
            addr,
            PeerSlot { commands_tx: commands_tx.clone(), capabilities: conn.capabilities, am_choking: true },
        );
        self.send_initial_bitfield(&commands_tx).await;
        tokio::spawn(conn.run(commands_rx));
        Ok(())
    }

    async fn register_connection(&mut self, connection: Connection) {
        let addr = connection.remote_addr;
        let capabilities = connection.capabilities;
        let (commands_tx, commands_rx) = mpsc::channel(PEER_COMMAND_CHANNEL_CAPACITY);

        if self.connections.len() >= self.conf.max_peers {
            debug!(%addr, "rejecting inbound connection, session is at its peer limit");
            let _ = commands_tx.send(PeerCommand::Disconnect).await;
            tokio::spawn(connection.run(commands_rx));
            return;
        }

        self.connections.insert(
            addr,
            PeerSlot { commands_tx: commands_tx.clone(), capabilities, am_choking: true },
        );
        self.send_initial_bitfield(&commands_tx).await;
        tokio::spawn(connection.run(commands_rx));
    }

    async fn send_initial_bitfield(&self, commands_tx: &mpsc::Sender<PeerCommand>) {
        let bitfield = self.scheduler.our_bitfield().clone();
        if bitfield.count() > 0 {
            let _ = commands_tx.send(PeerCommand::Bitfield(bitfield)).await;
        }
    }

    async fn handle_event(&mut self, addr: SocketAddr, event: PeerEvent) {
        match event {
            PeerEvent::BitfieldReceived(raw) => self.handle_bitfield(addr, raw).await,
            PeerEvent::HaveReceived(index) => {
                self.scheduler.peer_have(addr, index);
                self.update_interest(addr).await;
            }
            PeerEvent::ChokeChanged(choking) => {
                self.scheduler.set_choking_us(addr, choking);
                if !choking {
                    self.refill_requests(addr).await;
                }
            }
            PeerEvent::InterestChanged(interested) => {
                if interested {
                    self.set_am_choking(addr, false).await;
                }
            }
            PeerEvent::BlockReceived { index, begin, block } => {
                self.handle_block_received(addr, index as usize, begin, block).await;
            }
            PeerEvent::BlockRequested(block) => {
                self.handle_block_requested(addr, block).await;
            }
            PeerEvent::CancelReceived(_) => {
                // Outgoing pieces aren't queued ahead of time in this
                // core; a cancel that loses the race with an
                // already-sent piece is harmless.
            }
            PeerEvent::Disconnected { error, penalty } => {
                self.handle_disconnect(addr, error, penalty);
            }
        }
    }

    async fn handle_bitfield(&mut self, addr: SocketAddr, raw: Bytes) {
        let Some(bitfield) = Bitfield::from_bytes(self.scheduler.total_pieces(), &raw) else {
            warn!(%addr, "peer sent a bitfield shorter than our piece count");
            self.send_command(addr, PeerCommand::Disconnect).await;
            return;
        };
        self.scheduler.register_peer(addr, bitfield);
        self.update_interest(addr).await;
    }

    async fn update_interest(&mut self, addr: SocketAddr) {
        let interested = self.scheduler.is_interesting(addr);
        self.send_command(addr, PeerCommand::SetInterested(interested)).await;
        if interested {
            self.refill_requests(addr).await;
        }
    }

    async fn refill_requests(&mut self, addr: SocketAddr) {
        let window = self.conf.scheduler.request_window;
        let intents = self.scheduler.next_requests(addr, window);
        self.dispatch_intents(intents).await;
    }

    async fn dispatch_intents(&mut self, intents: Vec<Intent>) {
        for intent in intents {
            match intent {
                Intent::Request { peer, block } => {
                    self.send_command(peer, PeerCommand::Request(block)).await;
                }
                Intent::Cancel { peer, block } => {
                    self.send_command(peer, PeerCommand::Cancel(block)).await;
                }
            }
        }
    }

    async fn handle_block_received(&mut self, addr: SocketAddr, index: usize, begin: u32, block: Bytes) {
        let (outcome, cancels) = self.scheduler.on_block_received(addr, index, begin, &block);
        self.dispatch_intents(cancels).await;

        match outcome {
            BlockOutcome::Recorded | BlockOutcome::Duplicate => {
                self.refill_requests(addr).await;
            }
            BlockOutcome::PieceCompleted { index, data, contributors } => {
                if let Err(e) = self.storage.write_piece(index, data).await {
                    warn!(%e, index, "failed to commit completed piece to storage");
                    return;
                }
                debug!(index, "piece verified and committed");
                self.broadcast_have(index, &contributors).await;
                if self.scheduler.our_bitfield().complete() && !self.completed_announced {
                    self.completed_announced = true;
                    self.announce(TrackerEvent::Completed).await;
                }
                self.refill_requests(addr).await;
            }
            BlockOutcome::PieceInvalid { penalize, .. } => {
                for peer in penalize {
                    debug!(%peer, "penalized for contributing to a corrupt piece");
                }
                self.refill_requests(addr).await;
            }
        }
    }

    async fn handle_block_requested(&mut self, addr: SocketAddr, block: BlockInfo) {
        let index = block.piece_index as usize;
        if !self.scheduler.our_bitfield().has(index) {
            return;
        }
        if self.connections.get(&addr).is_none_or(|slot| slot.am_choking) {
            return;
        }
        match self.storage.read_piece(index).await {
            Ok(piece) => {
                let start = block.begin as usize;
                let end = (start + block.length as usize).min(piece.len());
                if start >= end {
                    return;
                }
                let data = Bytes::copy_from_slice(&piece[start..end]);
                self.uploaded += data.len() as u64;
                self.send_command(
                    addr,
                    PeerCommand::Piece { index: block.piece_index, begin: block.begin, block: data },
                )
                .await;
            }
            Err(e) => warn!(%e, index, "failed to read piece for a peer request"),
        }
    }

    /// Announces a newly-completed piece to every connected peer except
    /// those in `contributors`, which sent us the piece and so already
    /// know they have it.
    async fn broadcast_have(&mut self, index: usize, contributors: &[SocketAddr]) {
        let addrs: Vec<SocketAddr> =
            self.connections.keys().copied().filter(|addr| !contributors.contains(addr)).collect();
        for addr in addrs {
            self.send_command(addr, PeerCommand::Have(index)).await;
        }
    }

    fn handle_disconnect(&mut self, addr: SocketAddr, error: Option<String>, penalty: u8) {
        if let Some(error) = error {
            debug!(%addr, penalty, %error, "peer connection closed");
        }
        self.connections.remove(&addr);
        self.scheduler.unregister_peer(addr);
    }

    async fn handle_timeouts(&mut self) {
        let timeouts = self.scheduler.check_timeouts(std::time::Instant::now());
        let mut affected: Vec<SocketAddr> = Vec::new();
        for timeout in timeouts {
            warn!(peer = %timeout.peer, block = ?timeout.block, "request timed out");
            if !affected.contains(&timeout.peer) {
                affected.push(timeout.peer);
            }
        }
        for addr in affected {
            self.refill_requests(addr).await;
        }
    }

    async fn send_command(&mut self, addr: SocketAddr, cmd: PeerCommand) {
        if let Some(slot) = self.connections.get(&addr) {
            let _ = slot.commands_tx.send(cmd).await;
        }
    }

    /// Updates our choke state for `addr` and tells the connection,
    /// gating `handle_block_requested`'s access to storage on it.
    async fn set_am_choking(&mut self, addr: SocketAddr, choking: bool) {
        if let Some(slot) = self.connections.get_mut(&addr) {
            slot.am_choking = choking;
        }
        self.send_command(addr, PeerCommand::SetChoke(choking)).await;
    }

    fn progress(&self) -> Progress {
        let our_bitfield = self.scheduler.our_bitfield();
        let downloaded: u64 = our_bitfield
            .iter_set()
            .map(|i| self.scheduler.piece_length(i) as u64)
            .sum();
        let total = self.metainfo.info.length as u64;
        Progress { downloaded, uploaded: self.uploaded, left: total.saturating_sub(downloaded) }
    }

    async fn announce(&mut self, event: TrackerEvent) {
        let Some(tracker) = &self.tracker else { return };
        let progress = self.progress();
        let request = AnnounceRequest {
            info_hash: self.info_hash,
            peer_id: self.our_peer_id,
            port: tracker::DEFAULT_PORT,
            uploaded: progress.uploaded,
            downloaded: progress.downloaded,
            left: progress.left,
            event,
            numwant: self.conf.scheduler.numwant_default,
        };
        match tracker.announce(&request).await {
            Ok(response) => {
                if !response.interval.is_zero() {
                    self.announce_interval = response.interval;
                }
                for peer_addr in response.peers {
                    let addr = SocketAddr::V4(peer_addr);
                    if !self.connections.contains_key(&addr) {
                        if let Err(e) = self.connect(addr).await {
                            debug!(%addr, %e, "failed to connect to tracker-supplied peer");
                        }
                    }
                }
            }
            Err(e) => warn!(%e, "tracker announce failed"),
        }
    }

    async fn shutdown(&mut self) {
        let addrs: Vec<SocketAddr> = self.connections.keys().copied().collect();
        for addr in addrs {
            self.send_command(addr, PeerCommand::SetInterested(false)).await;
            self.send_command(addr, PeerCommand::Disconnect).await;
        }
        self.announce(TrackerEvent::Stopped).await;
    }
}
