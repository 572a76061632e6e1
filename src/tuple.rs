use std::cmp::Ordering;
use std::io::{self, Read};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{Error, Result};

/// Fixed per-tuple encoding overhead: raw-key length (u32), snapshot id
/// (u64), value length (u32).
pub const TUPLE_OVERHEAD: usize = 16;

/// Monotonic version assigned to every write. Snapshot ids start at 1;
/// `Snapshot::MAX` reads the latest version of everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Snapshot(pub u64);

impl Snapshot {
    pub const MAX: Snapshot = Snapshot(u64::MAX);

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Multi-version key: raw user bytes plus the snapshot id of the write
/// that produced the tuple.
///
/// Ordering is lexicographic on the raw bytes, then ascending by
/// snapshot id, so all versions of one raw key are adjacent and the
/// newest version sorts last within the run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    raw: Vec<u8>,
    snapshot: u64,
}

impl Key {
    pub fn new(raw: impl Into<Vec<u8>>, snapshot: u64) -> Key {
        Key {
            raw: raw.into(),
            snapshot,
        }
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn snapshot(&self) -> u64 {
        self.snapshot
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Key) -> Ordering {
        self.raw
            .cmp(&other.raw)
            .then(self.snapshot.cmp(&other.snapshot))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Key) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// One versioned key-value pair. A zero-length value is a tombstone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tuple {
    key: Key,
    value: Vec<u8>,
}

impl Tuple {
    pub fn new(key: Key, value: impl Into<Vec<u8>>) -> Tuple {
        Tuple {
            key,
            value: value.into(),
        }
    }

    /// A deletion marker for `key`.
    pub fn tombstone(key: Key) -> Tuple {
        Tuple {
            key,
            value: Vec::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_empty()
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// Size of the encoded representation.
    pub fn encoded_len(&self) -> usize {
        TUPLE_OVERHEAD + self.key.raw.len() + self.value.len()
    }

    /// Serialize as `{raw_len u32, raw, snapshot u64, value_len u32,
    /// value}`, all integers big-endian.
    pub fn encode_into(&self, buf: &mut Vec<u8>) {
        buf.reserve(self.encoded_len());
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<BigEndian>(self.key.raw.len() as u32);
        buf.extend_from_slice(&self.key.raw);
        let _ = buf.write_u64::<BigEndian>(self.key.snapshot);
        let _ = buf.write_u32::<BigEndian>(self.value.len() as u32);
        buf.extend_from_slice(&self.value);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf
    }

    /// Decode one tuple from a reader positioned at its first byte.
    pub fn decode(reader: &mut impl Read) -> Result<Tuple> {
        let decode_err = |e: io::Error| Error::Decode("tuple", e);
        let raw_len = reader.read_u32::<BigEndian>().map_err(decode_err)? as usize;
        let mut raw = vec![0u8; raw_len];
        reader.read_exact(&mut raw).map_err(decode_err)?;
        let snapshot = reader.read_u64::<BigEndian>().map_err(decode_err)?;
        let value_len = reader.read_u32::<BigEndian>().map_err(decode_err)? as usize;
        let mut value = vec![0u8; value_len];
        reader.read_exact(&mut value).map_err(decode_err)?;
        Ok(Tuple {
            key: Key { raw, snapshot },
            value,
        })
    }

    /// Decode one tuple starting at `pos` in `buf`, returning it with
    /// the offset just past its encoding.
    pub fn decode_at(buf: &[u8], pos: usize) -> Result<(Tuple, usize)> {
        let mut cursor = &buf[pos.min(buf.len())..];
        let before = cursor.len();
        let tuple = Tuple::decode(&mut cursor)?;
        Ok((tuple, pos + (before - cursor.len())))
    }
}
