//! The per-peer connection state machine.
//!
//! Setup negotiates a handshake (and, if both sides advertise extended
//! messaging, an extended handshake) before any data-bearing message is
//! admitted. The running state machine then pumps frames in both
//! directions until the peer disconnects, times out, floods, or a
//! higher layer asks to close.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::codec::{Framed, FramedParts};

use crate::bitfield::Bitfield;
use crate::block::BlockInfo;
use crate::conf::PeerConf;
use crate::error::{HandshakeError, LivenessError, PeerError, ProtocolError};
use crate::types::{InfoHash, PeerId, PieceIndex};
use crate::wire::handshake::{HandshakeCodec, PROTOCOL};
use crate::wire::{Handshake, Message, MessageCodec};

use super::capabilities::Capabilities;
use super::flood::FloodDetector;
use super::stats::Stats;

/// Choke/interest flags tracked in both directions, per §4.3.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChokeInterestState {
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
}

impl ChokeInterestState {
    /// New connections start choking the peer and uninterested in it,
    /// per the wire protocol's default state.
    pub fn new() -> Self {
        ChokeInterestState {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

/// Notifications the connection posts to whoever owns it (normally the
/// session's scheduler).
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    BitfieldReceived(Bytes),
    HaveReceived(PieceIndex),
    ChokeChanged(bool),
    InterestChanged(bool),
    BlockReceived { index: u32, begin: u32, block: Bytes },
    BlockRequested(BlockInfo),
    CancelReceived(BlockInfo),
    Disconnected { error: Option<String>, penalty: u8 },
}

/// Commands a higher layer can issue to an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerCommand {
    SetChoke(bool),
    SetInterested(bool),
    Have(PieceIndex),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Cancel(BlockInfo),
    Piece { index: u32, begin: u32, block: Bytes },
    Disconnect,
}

pub struct Connection {
    pub remote_addr: SocketAddr,
    framed: Framed<TcpStream, MessageCodec>,
    pub capabilities: Capabilities,
    state: ChokeInterestState,
    stats: Stats,
    flood: Arc<dyn FloodDetector>,
    conf: PeerConf,
    bitfield_sent: bool,
    bitfield_received: bool,
    extended_required: bool,
    extended_done: bool,
    last_sent: Instant,
    last_received: Instant,
    events_tx: mpsc::Sender<(SocketAddr, PeerEvent)>,
}

impl Connection {
    /// Opens a TCP connection and runs the outbound handshake sequence.
    pub async fn connect_outbound(
        addr: SocketAddr,
        info_hash: InfoHash,
        our_peer_id: PeerId,
        our_capabilities: Capabilities,
        expected_peer_id: Option<PeerId>,
        flood: Arc<dyn FloodDetector>,
        conf: PeerConf,
        events_tx: mpsc::Sender<(SocketAddr, PeerEvent)>,
    ) -> Result<Connection, PeerError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|_| PeerError::Liveness(LivenessError::PeerDisconnected))?;
        let mut handshakes = Framed::new(stream, HandshakeCodec);

        let our_hs = Handshake::new(info_hash, our_peer_id, our_capabilities);
        handshakes
            .send(our_hs)
            .await
            .map_err(|_| PeerError::Liveness(LivenessError::PeerDisconnected))?;

        let their_hs = recv_handshake(&mut handshakes).await?;
        if their_hs.protocol != PROTOCOL {
            return Err(PeerError::Handshake(HandshakeError::UnexpectedProtocol));
        }
        if their_hs.info_hash != info_hash {
            return Err(PeerError::Handshake(HandshakeError::UnexpectedTopic));
        }
        if let Some(expected) = expected_peer_id {
            if their_hs.peer_id != expected {
                return Err(PeerError::Handshake(HandshakeError::UnexpectedPeerId));
            }
        }

        let effective = our_capabilities.effective(their_hs.capabilities);
        Connection::from_handshaken(
            handshakes, addr, effective, flood, conf, events_tx,
        )
        .await
    }

    /// Reads the inbound handshake, resolves the swarm by info-hash via
    /// `resolve` (which hands back the target session's event sender),
    /// and replies with our own handshake.
    pub async fn accept_inbound(
        stream: TcpStream,
        addr: SocketAddr,
        our_peer_id: PeerId,
        our_capabilities: Capabilities,
        resolve: impl FnOnce(InfoHash) -> Option<mpsc::Sender<(SocketAddr, PeerEvent)>>,
        flood: Arc<dyn FloodDetector>,
        conf: PeerConf,
    ) -> Result<(Connection, InfoHash), PeerError> {
        let mut handshakes = Framed::new(stream, HandshakeCodec);
        let their_hs = recv_handshake(&mut handshakes).await?;

        if their_hs.protocol != PROTOCOL {
            return Err(PeerError::Handshake(HandshakeError::InvalidProtocol));
        }
        let Some(events_tx) = resolve(their_hs.info_hash) else {
            return Err(PeerError::Handshake(HandshakeError::UnknownTopic(
                their_hs.info_hash,
            )));
        };

        let our_hs = Handshake::new(their_hs.info_hash, our_peer_id, our_capabilities);
        handshakes
            .send(our_hs)
            .await
            .map_err(|_| PeerError::Liveness(LivenessError::PeerDisconnected))?;

        let effective = our_capabilities.effective(their_hs.capabilities);
        let conn = Connection::from_handshaken(
            handshakes, addr, effective, flood, conf, events_tx,
        )
        .await?;
        Ok((conn, their_hs.info_hash))
    }

    async fn from_handshaken(
        handshakes: Framed<TcpStream, HandshakeCodec>,
        addr: SocketAddr,
        capabilities: Capabilities,
        flood: Arc<dyn FloodDetector>,
        conf: PeerConf,
        events_tx: mpsc::Sender<(SocketAddr, PeerEvent)>,
    ) -> Result<Connection, PeerError> {
        let parts = handshakes.into_parts();
        let mut message_parts = FramedParts::new(parts.io, MessageCodec::default());
        message_parts.read_buf = parts.read_buf;
        message_parts.write_buf = parts.write_buf;
        let framed = Framed::from_parts(message_parts);

        let now = Instant::now();
        Ok(Connection {
            remote_addr: addr,
            framed,
            capabilities,
            state: ChokeInterestState::new(),
            stats: Stats::default(),
            flood,
            extended_required: capabilities.extended(),
            extended_done: false,
            bitfield_sent: false,
            bitfield_received: false,
            last_sent: now,
            last_received: now,
            conf,
            events_tx,
        })
    }

    pub fn state(&self) -> ChokeInterestState {
        self.state
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    /// Runs the connection's full duplex loop until it terminates, then
    /// posts a final `Disconnected` event with the penalty the caller
    /// should apply to this peer's reputation.
    pub async fn run(mut self, mut commands_rx: mpsc::Receiver<PeerCommand>) {
        let (error, penalty) = loop {
            let keepalive_interval = time::sleep(
                self.conf
                    .keepalive_interval
                    .saturating_sub(self.last_sent.elapsed()),
            );
            let timeout = time::sleep(
                self.conf
                    .keepalive_timeout
                    .saturating_sub(self.last_received.elapsed()),
            );

            tokio::select! {
                frame = self.framed.next() => {
                    match frame {
                        Some(Ok(msg)) => {
                            self.last_received = Instant::now();
                            if let Err(e) = self.handle_incoming(msg).await {
                                break (Some(e.to_string()), e.penalty());
                            }
                        }
                        Some(Err(e)) => {
                            let e = PeerError::Protocol(ProtocolError::DecodingError(e.to_string()));
                            break (Some(e.to_string()), e.penalty());
                        }
                        None => break (Some("connection closed".to_string()), 0),
                    }
                }
                cmd = commands_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Disconnect) | None => {
                            break (None, 0);
                        }
                        Some(cmd) => {
                            if let Err(e) = self.handle_command(cmd).await {
                                break (Some(e.to_string()), e.penalty());
                            }
                        }
                    }
                }
                _ = keepalive_interval => {
                    if let Err(e) = self.send(Message::KeepAlive).await {
                        break (Some(e.to_string()), e.penalty());
                    }
                }
                _ = timeout => {
                    break (
                        Some(PeerError::Liveness(LivenessError::PeerDisconnected).to_string()),
                        0,
                    );
                }
            }
        };

        let _ = self
            .events_tx
            .send((self.remote_addr, PeerEvent::Disconnected { error, penalty }))
            .await;
    }

    async fn send(&mut self, msg: Message) -> Result<(), PeerError> {
        self.gate_outgoing(&msg)?;
        self.framed
            .send(msg)
            .await
            .map_err(|_| PeerError::Liveness(LivenessError::PeerDisconnected))?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn gate_outgoing(&self, msg: &Message) -> Result<(), PeerError> {
        self.check_capability(msg)
    }

    fn check_capability(&self, msg: &Message) -> Result<(), PeerError> {
        let required = match msg {
            Message::Port(_) if !self.capabilities.dht() => Some("port (requires DHT)"),
            Message::Extended { .. } if !self.capabilities.extended() => {
                Some("extended (requires extended-messaging)")
            }
            _ => None,
        };
        match required {
            Some(name) => Err(PeerError::Protocol(ProtocolError::DisallowedMessage(name))),
            None => Ok(()),
        }
    }

    async fn handle_command(&mut self, cmd: PeerCommand) -> Result<(), PeerError> {
        match cmd {
            PeerCommand::SetChoke(choking) => {
                self.state.am_choking = choking;
                self.send(if choking { Message::Choke } else { Message::Unchoke }).await
            }
            PeerCommand::SetInterested(interested) => {
                self.state.am_interested = interested;
                self.send(if interested { Message::Interested } else { Message::NotInterested })
                    .await
            }
            PeerCommand::Have(index) => self.send(Message::Have { index: index as u32 }).await,
            PeerCommand::Bitfield(bitfield) => {
                if self.bitfield_sent {
                    return Err(PeerError::Protocol(ProtocolError::BitfieldAlreadySent));
                }
                self.bitfield_sent = true;
                self.send(Message::Bitfield(Bytes::copy_from_slice(bitfield.as_bytes()))).await
            }
            PeerCommand::Request(block) => self.send(Message::Request(block)).await,
            PeerCommand::Cancel(block) => self.send(Message::Cancel(block)).await,
            PeerCommand::Piece { index, begin, block } => {
                self.send(Message::Piece { index, begin, block }).await
            }
            PeerCommand::Disconnect => Ok(()),
        }
    }

    async fn handle_incoming(&mut self, msg: Message) -> Result<(), PeerError> {
        if self.extended_required
            && !self.extended_done
            && !matches!(msg, Message::KeepAlive | Message::Extended { .. })
        {
            return Err(PeerError::Handshake(HandshakeError::HandshakeRefused));
        }
        self.check_capability(&msg)?;
        self.account(&msg);

        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                self.state.peer_choking = true;
                self.emit(PeerEvent::ChokeChanged(true)).await;
            }
            Message::Unchoke => {
                self.state.peer_choking = false;
                self.emit(PeerEvent::ChokeChanged(false)).await;
            }
            Message::Interested => {
                self.state.peer_interested = true;
                self.emit(PeerEvent::InterestChanged(true)).await;
            }
            Message::NotInterested => {
                self.state.peer_interested = false;
                self.emit(PeerEvent::InterestChanged(false)).await;
            }
            Message::Have { index } => {
                self.emit(PeerEvent::HaveReceived(index as PieceIndex)).await;
            }
            Message::Bitfield(bits) => {
                if self.bitfield_received {
                    return Err(PeerError::Protocol(ProtocolError::BitfieldAlreadySent));
                }
                self.bitfield_received = true;
                // Total piece count is unknown to the wire layer; the
                // caller reconstructs a sized Bitfield from the raw
                // bytes once it knows the torrent's piece count.
                self.emit(PeerEvent::BitfieldReceived(bits)).await;
            }
            Message::Request(block) => {
                self.emit(PeerEvent::BlockRequested(block)).await;
            }
            Message::Piece { index, begin, block } => {
                self.emit(PeerEvent::BlockReceived { index, begin, block }).await;
            }
            Message::Cancel(block) => {
                self.emit(PeerEvent::CancelReceived(block)).await;
            }
            Message::Port(_) => {
                // DHT port announcements are accepted but this core has
                // no DHT implementation to forward them to.
            }
            Message::Extended { .. } => {
                if !self.extended_done {
                    self.extended_done = true;
                } else {
                    // Extension-defined dispatch is opaque to the core;
                    // unknown extension messages are accepted and ignored.
                }
            }
            Message::Unknown { .. } => {}
        }

        if self.flood.is_flooded(&self.stats, self.conf.flood_factor, self.conf.flood_threshold) {
            return Err(PeerError::Liveness(LivenessError::FloodDetected));
        }
        Ok(())
    }

    fn account(&mut self, msg: &Message) {
        let overhead = 4 + msg.id().is_some() as u64;
        match msg {
            Message::Piece { block, .. } => self.stats.record(overhead, 8, block.len() as u64),
            Message::KeepAlive => self.stats.record(4, 0, 0),
            _ => {
                let mut buf = BytesMut::new();
                msg.write_payload(&mut buf);
                self.stats.record(overhead, buf.len() as u64, 0);
            }
        }
    }

    async fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send((self.remote_addr, event)).await;
    }
}

async fn recv_handshake(
    framed: &mut Framed<TcpStream, HandshakeCodec>,
) -> Result<Handshake, PeerError> {
    match framed.next().await {
        Some(Ok(hs)) => Ok(hs),
        Some(Err(e)) => Err(PeerError::Handshake(e)),
        None => Err(PeerError::Liveness(LivenessError::PeerDisconnected)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::DefaultFloodDetector;
    use crate::types::{InfoHash, PeerId};
    use tokio::net::TcpListener;

    #[test]
    fn default_state_chokes_and_is_uninterested() {
        let state = ChokeInterestState::new();
        assert!(state.am_choking);
        assert!(!state.am_interested);
        assert!(state.peer_choking);
        assert!(!state.peer_interested);
    }

    /// Both sides advertise extended-messaging, but the peer's first
    /// non-handshake frame is a plain `interested` instead of an
    /// extended handshake: the connection must refuse with
    /// `HandshakeRefused` rather than dispatch it.
    #[tokio::test]
    async fn non_extended_first_frame_is_refused_when_extended_is_required() {
        let info_hash = InfoHash([1u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server_addr = listener.local_addr().unwrap();
        let caps = Capabilities::default().with_extended();

        let server = tokio::spawn(async move {
            let (stream, addr) = listener.accept().await.unwrap();
            let (events_tx, mut events_rx) = mpsc::channel(8);
            let (conn, _) = Connection::accept_inbound(
                stream,
                addr,
                PeerId([2u8; 20]),
                caps,
                |_| Some(events_tx),
                Arc::new(DefaultFloodDetector),
                PeerConf::default(),
            )
            .await
            .unwrap();
            let (_cmd_tx, cmd_rx) = mpsc::channel(1);
            conn.run(cmd_rx).await;
            events_rx.recv().await
        });

        let stream = TcpStream::connect(server_addr).await.unwrap();
        let mut handshakes = Framed::new(stream, HandshakeCodec);
        handshakes
            .send(Handshake::new(info_hash, PeerId([3u8; 20]), caps))
            .await
            .unwrap();
        let _their_hs = handshakes.next().await.unwrap().unwrap();

        let parts = handshakes.into_parts();
        let mut message_parts = FramedParts::new(parts.io, MessageCodec::default());
        message_parts.read_buf = parts.read_buf;
        message_parts.write_buf = parts.write_buf;
        let mut framed = Framed::from_parts(message_parts);
        framed.send(Message::Interested).await.unwrap();

        let event = server.await.unwrap();
        match event {
            Some((_, PeerEvent::Disconnected { penalty, error })) => {
                assert_eq!(penalty, 1);
                assert!(error.unwrap().contains("refused"));
            }
            other => panic!("expected a Disconnected event, got {other:?}"),
        }
    }
}
