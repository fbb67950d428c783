//! Parses `.torrent` files (bencoded metainfo dictionaries).

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::{
    bencode::{Bencode, Encode},
    types::{InfoHash, Sha1Hash},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: String,
    pub info: Info,
    pub info_hash: InfoHash,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Total size of the dataset in bytes.
    pub length: i64,
    /// Suggested file/directory name.
    pub name: String,
    /// Number of bytes in each piece (the last piece may be shorter).
    pub piece_length: i64,
    /// Expected SHA-1 hash of each piece, in order.
    pub pieces: Vec<Sha1Hash>,
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum InfoError {
    #[error("missing 'length' field in info dictionary")]
    MissingLength,
    #[error("missing 'name' field in info dictionary")]
    MissingName,
    #[error("missing 'piece length' field in info dictionary")]
    MissingPieceLength,
    #[error("missing or malformed 'pieces' field in info dictionary")]
    MissingPieces,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MetainfoError {
    #[error("missing 'announce' field")]
    MissingAnnounce,
    #[error("missing 'info' field")]
    MissingInfo,
    #[error("invalid info dictionary: {0}")]
    InvalidInfo(InfoError),
    #[error("input is not valid bencode")]
    DecodingError,
}

const LENGTH: &[u8] = b"length";
const NAME: &[u8] = b"name";
const PIECE_LENGTH: &[u8] = b"piece length";
const PIECES: &[u8] = b"pieces";
const ANNOUNCE: &[u8] = b"announce";
const INFO: &[u8] = b"info";

impl Metainfo {
    pub fn parse(bytes: &[u8]) -> Result<Metainfo, MetainfoError> {
        let data = Bencode::decode(bytes).map_err(|_| MetainfoError::DecodingError)?;
        Metainfo::from_bencode(&data)
    }

    fn from_bencode(data: &Bencode) -> Result<Metainfo, MetainfoError> {
        let announce_field = data.get(ANNOUNCE).ok_or(MetainfoError::MissingAnnounce)?;
        let announce = String::from_utf8(
            announce_field
                .as_bytes()
                .ok_or(MetainfoError::MissingAnnounce)?
                .to_vec(),
        )
        .map_err(|_| MetainfoError::MissingAnnounce)?;

        let info_field = data.get(INFO).ok_or(MetainfoError::MissingInfo)?;
        let info = Info::from_bencode(info_field).map_err(MetainfoError::InvalidInfo)?;
        let info_hash = Self::calculate_info_hash(&info);

        Ok(Metainfo {
            announce,
            info,
            info_hash,
        })
    }

    /// SHA-1 of the re-encoded, canonical bencoding of the info dict.
    fn calculate_info_hash(info: &Info) -> InfoHash {
        let bencoded_info = Bencode::encode(info);
        let digest = Sha1::digest(&bencoded_info);
        InfoHash::from(<[u8; 20]>::from(digest))
    }

    pub fn total_pieces(&self) -> usize {
        self.info.pieces.len()
    }
}

impl Encode for Metainfo {
    fn to_bencode(&self) -> Bencode {
        let mut dict = BTreeMap::new();
        dict.insert(
            ANNOUNCE.to_vec(),
            Bencode::Bytes(self.announce.as_bytes().to_vec()),
        );
        dict.insert(INFO.to_vec(), self.info.to_bencode());
        Bencode::Dict(dict)
    }
}

impl Info {
    fn from_bencode(info_field: &Bencode) -> Result<Info, InfoError> {
        let length = info_field
            .get(LENGTH)
            .and_then(Bencode::as_int)
            .ok_or(InfoError::MissingLength)?;

        let name = info_field
            .get(NAME)
            .and_then(Bencode::as_bytes)
            .and_then(|b| String::from_utf8(b.to_vec()).ok())
            .ok_or(InfoError::MissingName)?;

        let piece_length = info_field
            .get(PIECE_LENGTH)
            .and_then(Bencode::as_int)
            .ok_or(InfoError::MissingPieceLength)?;

        let pieces_bytes = info_field
            .get(PIECES)
            .and_then(Bencode::as_bytes)
            .ok_or(InfoError::MissingPieces)?;
        if pieces_bytes.len() % 20 != 0 {
            return Err(InfoError::MissingPieces);
        }
        let pieces = pieces_bytes
            .chunks_exact(20)
            .map(|chunk| Sha1Hash::try_from(chunk).expect("chunk is exactly 20 bytes"))
            .collect();

        Ok(Info {
            length,
            name,
            piece_length,
            pieces,
        })
    }

    pub fn piece_length_for(&self, index: usize) -> u32 {
        let is_last = index + 1 == self.pieces.len();
        if is_last {
            let remainder = self.length as u64 % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length as u32
            } else {
                remainder as u32
            }
        } else {
            self.piece_length as u32
        }
    }
}

impl Encode for Info {
    fn to_bencode(&self) -> Bencode {
        let mut dict = BTreeMap::new();
        dict.insert(LENGTH.to_vec(), Bencode::Int(self.length));
        dict.insert(NAME.to_vec(), Bencode::Bytes(self.name.as_bytes().to_vec()));
        dict.insert(PIECE_LENGTH.to_vec(), Bencode::Int(self.piece_length));
        let concatenated: Vec<u8> = self
            .pieces
            .iter()
            .flat_map(|hash| hash.as_bytes().iter())
            .copied()
            .collect();
        dict.insert(PIECES.to_vec(), Bencode::Bytes(concatenated));
        Bencode::Dict(dict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_bytes() -> Vec<u8> {
        let info = Info {
            length: BLOCK_TEST_SIZE,
            name: "sample.iso".to_string(),
            piece_length: 32768,
            pieces: vec![Sha1Hash([1u8; 20]), Sha1Hash([2u8; 20])],
        };
        let metainfo = Metainfo {
            announce: "http://tracker.example/announce".to_string(),
            info_hash: InfoHash([0u8; 20]),
            info,
        };
        Bencode::encode(&metainfo)
    }

    const BLOCK_TEST_SIZE: i64 = 32768 + 100;

    #[test]
    fn parses_round_trip() {
        let bytes = sample_bytes();
        let parsed = Metainfo::parse(&bytes).unwrap();
        assert_eq!(parsed.announce, "http://tracker.example/announce");
        assert_eq!(parsed.info.name, "sample.iso");
        assert_eq!(parsed.total_pieces(), 2);
    }

    #[test]
    fn info_hash_is_deterministic() {
        let bytes = sample_bytes();
        let a = Metainfo::parse(&bytes).unwrap();
        let b = Metainfo::parse(&bytes).unwrap();
        assert_eq!(a.info_hash, b.info_hash);
    }

    #[test]
    fn last_piece_is_shortened() {
        let bytes = sample_bytes();
        let parsed = Metainfo::parse(&bytes).unwrap();
        assert_eq!(parsed.info.piece_length_for(0), 32768);
        assert_eq!(parsed.info.piece_length_for(1), 100);
    }

    #[test]
    fn rejects_missing_announce() {
        let mut dict = BTreeMap::new();
        dict.insert(INFO.to_vec(), Bencode::Int(1));
        let bytes = {
            struct W(Bencode);
            impl Encode for W {
                fn to_bencode(&self) -> Bencode {
                    self.0.clone()
                }
            }
            Bencode::encode(&W(Bencode::Dict(dict)))
        };
        assert_eq!(Metainfo::parse(&bytes), Err(MetainfoError::MissingAnnounce));
    }
}
