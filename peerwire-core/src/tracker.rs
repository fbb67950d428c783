//! An HTTP tracker client: announce/scrape requests and bencoded
//! response parsing.

use std::net::SocketAddrV4;
use std::time::Duration;

use percent_encoding::{percent_encode, AsciiSet, NON_ALPHANUMERIC};
use rand::Rng;
use thiserror::Error;

use crate::bencode::Bencode;
use crate::types::{InfoHash, PeerId};

pub const DEFAULT_PORT: u16 = 6881;
const NUMWANT_DEFAULT: u32 = 50;
const NUMWANT_CAP: u32 = 200;

/// Bytes that must be percent-encoded in a tracker query string beyond
/// what `NON_ALPHANUMERIC` already covers — none; raw info-hash/peer-id
/// bytes always go through `NON_ALPHANUMERIC` encoding.
const QUERY_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC;

/// Generates a fresh client peer-id: an Azureus-style `-RS` prefix
/// followed by random bytes.
pub fn generate_peer_id() -> PeerId {
    let mut id = [0u8; 20];
    id[0..3].copy_from_slice(b"-RS");
    rand::rng().fill(&mut id[3..]);
    PeerId(id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Empty,
    Started,
    Completed,
    Stopped,
}

impl Event {
    fn as_query_value(self) -> Option<&'static str> {
        match self {
            Event::Started => Some("started"),
            Event::Completed => Some("completed"),
            Event::Stopped => Some("stopped"),
            Event::Empty => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("HTTP request failed: {0}")]
    HttpRequest(#[from] reqwest::Error),
    #[error("tracker returned failure: {0}")]
    TrackerFailure(String),
    #[error("invalid response data: {0}")]
    InvalidResponse(String),
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
    pub numwant: u32,
}

impl AnnounceRequest {
    fn build_url(&self, announce_url: &str) -> String {
        let info_hash = percent_encode(self.info_hash.as_bytes(), QUERY_ENCODE_SET);
        let peer_id = percent_encode(self.peer_id.as_bytes(), QUERY_ENCODE_SET);
        let numwant = self.numwant.min(NUMWANT_CAP);

        let mut query = format!(
            "info_hash={info_hash}&peer_id={peer_id}&port={}&uploaded={}&downloaded={}&left={}&compact=1&numwant={numwant}",
            self.port, self.uploaded, self.downloaded, self.left,
        );
        if let Some(event) = self.event.as_query_value() {
            query.push_str("&event=");
            query.push_str(event);
        }

        let separator = if announce_url.contains('?') { '&' } else { '?' };
        format!("{announce_url}{separator}{query}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: Duration,
    pub peers: Vec<SocketAddrV4>,
    pub seeders: u64,
    pub leechers: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrapeResponse {
    pub complete: u64,
    pub incomplete: u64,
}

const FAILURE_REASON: &[u8] = b"failure reason";
const INTERVAL: &[u8] = b"interval";
const PEERS: &[u8] = b"peers";
const COMPLETE: &[u8] = b"complete";
const INCOMPLETE: &[u8] = b"incomplete";

impl AnnounceResponse {
    fn from_bencode(value: &Bencode) -> Result<Self, TrackerError> {
        let Bencode::Dict(dict) = value else {
            return Err(TrackerError::InvalidResponse("response is not a dictionary".into()));
        };

        if let Some(Bencode::Bytes(reason)) = dict.get(FAILURE_REASON) {
            let reason = String::from_utf8_lossy(reason).into_owned();
            return Err(TrackerError::TrackerFailure(reason));
        }

        let interval = dict
            .get(INTERVAL)
            .and_then(Bencode::as_int)
            .filter(|&i| i >= 0)
            .ok_or_else(|| TrackerError::InvalidResponse("missing or invalid 'interval'".into()))?;

        let peers = match dict.get(PEERS) {
            Some(Bencode::Bytes(bytes)) => parse_compact_peers(bytes),
            _ => return Err(TrackerError::InvalidResponse("missing or invalid 'peers'".into())),
        };

        let seeders = dict.get(COMPLETE).and_then(Bencode::as_int).filter(|&i| i >= 0).unwrap_or(0) as u64;
        let leechers =
            dict.get(INCOMPLETE).and_then(Bencode::as_int).filter(|&i| i >= 0).unwrap_or(0) as u64;

        Ok(AnnounceResponse {
            interval: Duration::from_secs(interval as u64),
            peers,
            seeders,
            leechers,
        })
    }
}

fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            SocketAddrV4::new(
                std::net::Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]),
                u16::from_be_bytes([chunk[4], chunk[5]]),
            )
        })
        .collect()
}

pub struct TrackerClient {
    http: reqwest::Client,
    announce_url: String,
}

impl TrackerClient {
    pub fn new(announce_url: String) -> Self {
        TrackerClient { http: reqwest::Client::new(), announce_url }
    }

    pub async fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let url = request.build_url(&self.announce_url);
        let bytes = self.http.get(url).send().await?.bytes().await?;
        let decoded = Bencode::decode(&bytes)
            .map_err(|e| TrackerError::InvalidResponse(format!("{e:?}")))?;
        AnnounceResponse::from_bencode(&decoded)
    }

    /// Swaps `announce` for `scrape` in the URL path, per BEP 48, and
    /// reads only the `complete`/`incomplete` counts.
    pub async fn scrape(&self, info_hash: InfoHash) -> Result<ScrapeResponse, TrackerError> {
        let scrape_url = self
            .announce_url
            .replacen("announce", "scrape", 1);
        let info_hash = percent_encode(info_hash.as_bytes(), QUERY_ENCODE_SET);
        let url = format!("{scrape_url}?info_hash={info_hash}");

        let bytes = self.http.get(url).send().await?.bytes().await?;
        let decoded = Bencode::decode(&bytes)
            .map_err(|e| TrackerError::InvalidResponse(format!("{e:?}")))?;
        let Bencode::Dict(dict) = &decoded else {
            return Err(TrackerError::InvalidResponse("scrape response is not a dictionary".into()));
        };
        let files = dict
            .get("files".as_bytes())
            .and_then(|v| if let Bencode::Dict(d) = v { d.values().next() } else { None })
            .ok_or_else(|| TrackerError::InvalidResponse("missing 'files' entry".into()))?;
        let complete = files.get(COMPLETE).and_then(Bencode::as_int).unwrap_or(0) as u64;
        let incomplete = files.get(INCOMPLETE).and_then(Bencode::as_int).unwrap_or(0) as u64;
        Ok(ScrapeResponse { complete, incomplete })
    }
}

pub fn default_numwant() -> u32 {
    NUMWANT_DEFAULT
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_percent_encodes_binary_fields() {
        let req = AnnounceRequest {
            info_hash: InfoHash([0xffu8; 20]),
            peer_id: PeerId([b'-'; 20]),
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Event::Started,
            numwant: 50,
        };
        let url = req.build_url("http://tracker.example/announce");
        assert!(url.contains("info_hash=%FF%FF%FF"));
        assert!(url.contains("event=started"));
    }

    #[test]
    fn numwant_is_capped() {
        let req = AnnounceRequest {
            info_hash: InfoHash([0; 20]),
            peer_id: PeerId([0; 20]),
            port: 1,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Event::Empty,
            numwant: 9999,
        };
        let url = req.build_url("http://t/announce");
        assert!(url.contains(&format!("numwant={NUMWANT_CAP}")));
        assert!(!url.contains("numwant=9999"));
    }

    #[test]
    fn parses_compact_peer_list() {
        let bytes = [127, 0, 0, 1, 0x1A, 0xE1];
        let peers = parse_compact_peers(&bytes);
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].port(), 0x1AE1);
    }

    #[test]
    fn rejects_failure_response() {
        let mut dict = std::collections::BTreeMap::new();
        dict.insert(FAILURE_REASON.to_vec(), Bencode::Bytes(b"banned".to_vec()));
        let result = AnnounceResponse::from_bencode(&Bencode::Dict(dict));
        assert!(matches!(result, Err(TrackerError::TrackerFailure(reason)) if reason == "banned"));
    }

    #[test]
    fn generated_peer_ids_carry_the_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id.as_bytes()[0..3], b"-RS");
    }
}
