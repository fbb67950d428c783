//! Core identifiers shared across the crate.

use std::fmt;

use thiserror::Error;

/// 20-byte SHA-1 of the info dictionary, identifying a swarm.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct InfoHash(pub [u8; 20]);

/// 20-byte peer identity, chosen once per process and sent in the handshake.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(pub [u8; 20]);

/// The expected SHA-1 hash of a single piece.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sha1Hash(pub [u8; 20]);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HashLengthError {
    #[error("expected 20 bytes, got {0}")]
    InvalidLength(usize),
}

macro_rules! hash_newtype {
    ($ty:ident) => {
        impl $ty {
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            pub fn from_hex(hex_str: &str) -> Result<Self, HashLengthError> {
                if hex_str.len() != 40 {
                    return Err(HashLengthError::InvalidLength(hex_str.len() / 2));
                }
                let mut bytes = [0u8; 20];
                hex::decode_to_slice(hex_str, &mut bytes)
                    .map_err(|_| HashLengthError::InvalidLength(hex_str.len() / 2))?;
                Ok(Self(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; 20] {
                &self.0
            }
        }

        impl From<[u8; 20]> for $ty {
            fn from(bytes: [u8; 20]) -> Self {
                Self(bytes)
            }
        }

        impl TryFrom<&[u8]> for $ty {
            type Error = HashLengthError;

            fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
                if value.len() != 20 {
                    return Err(HashLengthError::InvalidLength(value.len()));
                }
                let mut bytes = [0u8; 20];
                bytes.copy_from_slice(value);
                Ok(Self(bytes))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_tuple(stringify!($ty)).field(&self.to_hex()).finish()
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

hash_newtype!(InfoHash);
hash_newtype!(PeerId);
hash_newtype!(Sha1Hash);

/// Index of a piece within a torrent, `0..num_pieces`.
pub type PieceIndex = usize;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_round_trip() {
        let hash = InfoHash([7u8; 20]);
        let hex_str = hash.to_hex();
        assert_eq!(InfoHash::from_hex(&hex_str).unwrap(), hash);
    }

    #[test]
    fn rejects_wrong_length() {
        assert!(PeerId::try_from(&[0u8; 19][..]).is_err());
        assert!(PeerId::try_from(&[0u8; 20][..]).is_ok());
    }
}
