//! Inbound TCP listener and dispatch-by-info-hash, plus a bounded
//! outbound connector pool.
//!
//! One `Manager` serves every swarm this process participates in. It
//! owns the listener and the peer-id; sessions register themselves by
//! info-hash and the manager hands each accepted socket to the session
//! whose swarm it announced in its handshake, closing it with
//! `UnknownTopic` otherwise.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::conf::PeerConf;
use crate::peer::{Capabilities, Connection, DefaultFloodDetector, FloodDetector};
use crate::session::SessionHandle;
use crate::types::{InfoHash, PeerId};

/// Caps concurrent accept-side handshakes and concurrent outbound
/// connection attempts, independent of any one session's peer limit.
#[derive(Debug, Clone, Copy)]
pub struct ManagerConf {
    pub max_inbound_handshakes: usize,
    pub max_outbound_connects: usize,
    /// Global cap on connections across every session this manager
    /// serves, independent of each session's own `Conf::max_peers`.
    pub max_connections: usize,
}

impl ManagerConf {
    pub fn new() -> Self {
        ManagerConf { max_inbound_handshakes: 32, max_outbound_connects: 32, max_connections: 500 }
    }
}

impl Default for ManagerConf {
    fn default() -> Self {
        Self::new()
    }
}

/// Registry of live sessions by info-hash, plus the accept/connect
/// worker pools that feed them.
pub struct Manager {
    our_peer_id: PeerId,
    our_capabilities: Capabilities,
    peer_conf: PeerConf,
    flood: Arc<dyn FloodDetector>,
    sessions: Arc<RwLock<HashMap<InfoHash, SessionHandle>>>,
    inbound_permits: Arc<Semaphore>,
    outbound_permits: Arc<Semaphore>,
    max_connections: usize,
}

impl Manager {
    pub fn new(our_peer_id: PeerId, our_capabilities: Capabilities, peer_conf: PeerConf, conf: ManagerConf) -> Self {
        Manager {
            our_peer_id,
            our_capabilities,
            peer_conf,
            flood: Arc::new(DefaultFloodDetector),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            inbound_permits: Arc::new(Semaphore::new(conf.max_inbound_handshakes)),
            outbound_permits: Arc::new(Semaphore::new(conf.max_outbound_connects)),
            max_connections: conf.max_connections,
        }
    }

    /// Sums live connection counts across every registered session.
    /// Queried fresh on each check so the global cap reflects peers
    /// that have actually disconnected, not a separately tracked tally.
    async fn total_connections(&self) -> usize {
        let handles: Vec<SessionHandle> =
            self.sessions.read().expect("session registry poisoned").values().cloned().collect();
        let mut total = 0;
        for handle in handles {
            total += handle.connection_count().await.unwrap_or(0);
        }
        total
    }

    /// Registers a session so inbound connections announcing its
    /// info-hash are dispatched to it. Replaces any existing
    /// registration for the same swarm.
    pub fn register_session(&self, handle: SessionHandle) {
        let info_hash = handle.info_hash();
        self.sessions.write().expect("session registry poisoned").insert(info_hash, handle);
    }

    pub fn unregister_session(&self, info_hash: InfoHash) {
        self.sessions.write().expect("session registry poisoned").remove(&info_hash);
    }

    /// Opens an outbound connection to `addr` bound to `info_hash`'s
    /// session, if registered. Respects the global connection cap.
    pub async fn connect(&self, info_hash: InfoHash, addr: SocketAddr) -> std::io::Result<()> {
        let Some(handle) = self.sessions.read().expect("session registry poisoned").get(&info_hash).cloned()
        else {
            return Err(std::io::Error::new(std::io::ErrorKind::NotFound, "no session for info-hash"));
        };
        if self.total_connections().await >= self.max_connections {
            return Err(std::io::Error::new(std::io::ErrorKind::Other, "global connection limit reached"));
        }
        let _permit = self
            .outbound_permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "connector pool closed"))?;
        handle
            .connect(addr)
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e.to_string()))
    }

    /// Binds `addr` and accepts inbound connections until the process
    /// shuts down, spawning a bounded handshake worker per socket.
    pub async fn run(self: Arc<Self>, addr: SocketAddr) -> std::io::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "manager listening for inbound peers");
        loop {
            match listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        manager.accept_one(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    warn!(%e, "failed to accept inbound connection");
                }
            }
        }
    }

    async fn accept_one(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let Ok(_permit) = self.inbound_permits.clone().acquire_owned().await else {
            return;
        };

        if self.total_connections().await >= self.max_connections {
            warn!(%addr, "rejecting inbound connection: global connection limit reached");
            return;
        }

        let sessions = self.sessions.clone();
        let resolve = move |info_hash: InfoHash| {
            sessions
                .read()
                .expect("session registry poisoned")
                .get(&info_hash)
                .map(|handle| handle.events_tx())
        };

        let result = Connection::accept_inbound(
            stream,
            addr,
            self.our_peer_id,
            self.our_capabilities,
            resolve,
            self.flood.clone(),
            self.peer_conf.clone(),
        )
        .await;

        match result {
            Ok((connection, info_hash)) => {
                let handle = self.sessions.read().expect("session registry poisoned").get(&info_hash).cloned();
                match handle {
                    Some(handle) => {
                        handle.adopt(connection).await;
                    }
                    None => warn!(%addr, %info_hash, "session vanished between resolve and adopt"),
                }
            }
            Err(e) => {
                warn!(%addr, %e, "rejected inbound connection");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conf::Conf;
    use crate::metainfo::{Info, Metainfo};
    use crate::session::Session;
    use crate::storage::FileStorage;
    use crate::types::Sha1Hash;

    async fn sample_session(info_hash: InfoHash, tag: u8) -> SessionHandle {
        let metainfo = Arc::new(Metainfo {
            announce: String::new(),
            info: Info { length: 16, name: "t".into(), piece_length: 16, pieces: vec![Sha1Hash([0u8; 20])] },
            info_hash,
        });
        let path = std::env::temp_dir().join(format!("peerwire-manager-test-{tag}.bin"));
        let storage = FileStorage::create(path, 16, 16, 1).await.unwrap();
        let (session, handle) =
            Session::new(PeerId([1u8; 20]), Capabilities::default(), metainfo, Arc::new(storage), Conf::new());
        tokio::spawn(session.start());
        handle
    }

    #[tokio::test]
    async fn connect_fails_fast_for_unknown_info_hash() {
        let manager = Manager::new(PeerId([2u8; 20]), Capabilities::default(), PeerConf::default(), ManagerConf::new());
        let err = manager.connect(InfoHash([9u8; 20]), "127.0.0.1:1".parse().unwrap()).await;
        assert_eq!(err.unwrap_err().kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn connect_respects_the_global_connection_cap() {
        let info_hash = InfoHash([3u8; 20]);
        let handle = sample_session(info_hash, 1).await;
        let conf = ManagerConf { max_connections: 0, ..ManagerConf::new() };
        let manager = Manager::new(PeerId([2u8; 20]), Capabilities::default(), PeerConf::default(), conf);
        manager.register_session(handle);

        let err = manager.connect(info_hash, "127.0.0.1:1".parse().unwrap()).await;
        assert_eq!(err.unwrap_err().kind(), std::io::ErrorKind::Other);
    }

    #[tokio::test]
    async fn total_connections_sums_across_sessions() {
        let manager = Manager::new(PeerId([2u8; 20]), Capabilities::default(), PeerConf::default(), ManagerConf::new());
        manager.register_session(sample_session(InfoHash([5u8; 20]), 3).await);
        manager.register_session(sample_session(InfoHash([6u8; 20]), 4).await);

        assert_eq!(manager.total_connections().await, 0);
    }

    #[tokio::test]
    async fn register_and_unregister_session() {
        let info_hash = InfoHash([4u8; 20]);
        let handle = sample_session(info_hash, 2).await;
        let manager = Manager::new(PeerId([2u8; 20]), Capabilities::default(), PeerConf::default(), ManagerConf::new());

        manager.register_session(handle);
        assert!(manager.sessions.read().unwrap().contains_key(&info_hash));

        manager.unregister_session(info_hash);
        assert!(!manager.sessions.read().unwrap().contains_key(&info_hash));
    }
}
