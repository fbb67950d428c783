//! A minimal bencode value type with a decoder and an encoder.
//!
//! Only what the metainfo parser and the tracker's HTTP response need:
//! integers, byte strings, lists and dictionaries (keys sorted, as
//! bencode requires for canonical encoding).

use std::collections::BTreeMap;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Bencode>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    Eof,
    #[error("invalid integer literal")]
    InvalidInt,
    #[error("invalid byte-string length prefix")]
    InvalidLength,
    #[error("dictionary keys must be byte strings")]
    NonStringKey,
    #[error("trailing data after a complete value")]
    TrailingData,
}

/// Trait implemented by types with a canonical bencode representation.
pub trait Encode {
    fn to_bencode(&self) -> Bencode;
}

impl Bencode {
    pub fn get(&self, key: &[u8]) -> Option<&Bencode> {
        match self {
            Bencode::Dict(map) => map.get(key),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Bencode::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Bencode::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Bencode]> {
        match self {
            Bencode::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn decode(input: &[u8]) -> Result<Bencode, DecodeError> {
        let mut cursor = Cursor { buf: input, pos: 0 };
        let value = cursor.parse_value()?;
        if cursor.pos != input.len() {
            return Err(DecodeError::TrailingData);
        }
        Ok(value)
    }

    pub fn encode(value: &impl Encode) -> Vec<u8> {
        let mut out = Vec::new();
        value.to_bencode().write_to(&mut out);
        out
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        match self {
            Bencode::Int(i) => {
                out.push(b'i');
                out.extend_from_slice(i.to_string().as_bytes());
                out.push(b'e');
            }
            Bencode::Bytes(bytes) => {
                out.extend_from_slice(bytes.len().to_string().as_bytes());
                out.push(b':');
                out.extend_from_slice(bytes);
            }
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    item.write_to(out);
                }
                out.push(b'e');
            }
            Bencode::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    Bencode::Bytes(key.clone()).write_to(out);
                    value.write_to(out);
                }
                out.push(b'e');
            }
        }
    }
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn peek(&self) -> Result<u8, DecodeError> {
        self.buf.get(self.pos).copied().ok_or(DecodeError::Eof)
    }

    fn parse_value(&mut self) -> Result<Bencode, DecodeError> {
        match self.peek()? {
            b'i' => self.parse_int(),
            b'l' => self.parse_list(),
            b'd' => self.parse_dict(),
            b'0'..=b'9' => self.parse_bytes().map(Bencode::Bytes),
            _ => Err(DecodeError::InvalidInt),
        }
    }

    fn read_until(&mut self, delim: u8) -> Result<&'a [u8], DecodeError> {
        let start = self.pos;
        while self.peek()? != delim {
            self.pos += 1;
        }
        let slice = &self.buf[start..self.pos];
        self.pos += 1; // consume delimiter
        Ok(slice)
    }

    fn parse_int(&mut self) -> Result<Bencode, DecodeError> {
        self.pos += 1; // 'i'
        let digits = self.read_until(b'e')?;
        let text = std::str::from_utf8(digits).map_err(|_| DecodeError::InvalidInt)?;
        let value = text.parse::<i64>().map_err(|_| DecodeError::InvalidInt)?;
        Ok(Bencode::Int(value))
    }

    fn parse_bytes(&mut self) -> Result<Vec<u8>, DecodeError> {
        let digits = self.read_until(b':')?;
        let text = std::str::from_utf8(digits).map_err(|_| DecodeError::InvalidLength)?;
        let len = text.parse::<usize>().map_err(|_| DecodeError::InvalidLength)?;
        if self.pos + len > self.buf.len() {
            return Err(DecodeError::Eof);
        }
        let bytes = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(bytes)
    }

    fn parse_list(&mut self) -> Result<Bencode, DecodeError> {
        self.pos += 1; // 'l'
        let mut items = Vec::new();
        while self.peek()? != b'e' {
            items.push(self.parse_value()?);
        }
        self.pos += 1; // 'e'
        Ok(Bencode::List(items))
    }

    fn parse_dict(&mut self) -> Result<Bencode, DecodeError> {
        self.pos += 1; // 'd'
        let mut map = BTreeMap::new();
        while self.peek()? != b'e' {
            let key = self.parse_bytes()?;
            let value = self.parse_value()?;
            map.insert(key, value);
        }
        self.pos += 1; // 'e'
        Ok(Bencode::Dict(map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_scalars() {
        assert_eq!(Bencode::decode(b"i42e").unwrap(), Bencode::Int(42));
        assert_eq!(
            Bencode::decode(b"4:spam").unwrap(),
            Bencode::Bytes(b"spam".to_vec())
        );
    }

    #[test]
    fn decodes_list_and_dict() {
        let list = Bencode::decode(b"l4:spam4:eggse").unwrap();
        assert_eq!(
            list,
            Bencode::List(vec![
                Bencode::Bytes(b"spam".to_vec()),
                Bencode::Bytes(b"eggs".to_vec())
            ])
        );

        let dict = Bencode::decode(b"d3:cow3:moo4:spam4:eggse").unwrap();
        let Bencode::Dict(map) = dict else {
            panic!("expected dict");
        };
        assert_eq!(map.get(b"cow".as_slice()).unwrap().as_bytes(), Some(b"moo".as_slice()));
    }

    #[test]
    fn rejects_trailing_garbage() {
        assert_eq!(Bencode::decode(b"i1ee"), Err(DecodeError::TrailingData));
    }

    #[test]
    fn round_trips_through_encode() {
        struct Wrapper(Bencode);
        impl Encode for Wrapper {
            fn to_bencode(&self) -> Bencode {
                self.0.clone()
            }
        }
        let original = Bencode::decode(b"d3:fooi7ee").unwrap();
        let bytes = Bencode::encode(&Wrapper(original.clone()));
        assert_eq!(Bencode::decode(&bytes).unwrap(), original);
    }
}
