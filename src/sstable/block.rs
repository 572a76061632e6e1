use std::cmp::Ordering;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::error::{Error, Result};
use crate::memory::Block;
use crate::merge::Direction;
use crate::tuple::{Key, Tuple};

/// Serialized layout: `{count u32, count * entry_offset u32, entries}`.
/// Offsets are absolute within the block, entries are packed tuple
/// encodings in ascending key order.
const HEADER_LEN: usize = 4;
const POINTER_LEN: usize = 4;

/// Accumulates tuples in key order and serializes them into one
/// contiguous sorted block.
pub struct SortedBlockBuilder {
    entries: Vec<u8>,
    offsets: Vec<u32>,
    last_key: Option<Key>,
}

impl SortedBlockBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            offsets: Vec::new(),
            last_key: None,
        }
    }

    /// Append a tuple. Tuples must arrive in strictly ascending key
    /// order.
    pub fn add(&mut self, tuple: &Tuple) {
        debug_assert!(
            self.last_key.as_ref().map_or(true, |k| k < tuple.key()),
            "sorted block entries must be added in ascending key order"
        );
        self.offsets.push(self.entries.len() as u32);
        tuple.encode_into(&mut self.entries);
        self.last_key = Some(tuple.key().clone());
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Size of the block this builder would currently serialize to.
    pub fn current_size(&self) -> usize {
        HEADER_LEN + POINTER_LEN * self.offsets.len() + self.entries.len()
    }

    /// Serialize into the final block bytes.
    pub fn finish(self) -> Vec<u8> {
        let header = HEADER_LEN + POINTER_LEN * self.offsets.len();
        let mut buf = Vec::with_capacity(header + self.entries.len());
        // Writes into a Vec cannot fail.
        let _ = buf.write_u32::<BigEndian>(self.offsets.len() as u32);
        for offset in &self.offsets {
            let _ = buf.write_u32::<BigEndian>(header as u32 + offset);
        }
        buf.extend_from_slice(&self.entries);
        buf
    }

    pub fn finish_block(self) -> Block {
        Block::copy_from(&self.finish())
    }
}

impl Default for SortedBlockBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-side view over one serialized sorted block. Lookups binary
/// search the pointer table and compare keys in place, without decoding
/// whole entries.
#[derive(Clone)]
pub struct SortedBlock {
    block: Block,
    count: usize,
}

impl SortedBlock {
    pub fn new(block: Block) -> Result<Self> {
        if block.len() < HEADER_LEN {
            return Err(Error::corrupt("sorted block", "shorter than header"));
        }
        let count = BigEndian::read_u32(&block[..HEADER_LEN]) as usize;
        let header = HEADER_LEN + POINTER_LEN * count;
        if block.len() < header {
            return Err(Error::corrupt(
                "sorted block",
                format!("pointer table for {count} entries exceeds block"),
            ));
        }
        let parsed = SortedBlock { block, count };
        for i in 0..count {
            let offset = parsed.entry_offset(i);
            if offset < header || offset >= parsed.block.len() {
                return Err(Error::corrupt(
                    "sorted block",
                    format!("entry {i} offset {offset} out of bounds"),
                ));
            }
        }
        Ok(parsed)
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    fn entry_offset(&self, index: usize) -> usize {
        let at = HEADER_LEN + POINTER_LEN * index;
        BigEndian::read_u32(&self.block[at..at + POINTER_LEN]) as usize
    }

    /// Decode the full tuple at `index`.
    pub fn tuple_at(&self, index: usize) -> Result<Tuple> {
        let (tuple, _) = Tuple::decode_at(&self.block, self.entry_offset(index))?;
        Ok(tuple)
    }

    /// Borrow the key fields at `index` straight out of the buffer.
    fn key_at(&self, index: usize) -> Result<(&[u8], u64)> {
        let pos = self.entry_offset(index);
        let buf = &self.block[..];
        if pos + 4 > buf.len() {
            return Err(Error::corrupt("sorted block", "entry header truncated"));
        }
        let raw_len = BigEndian::read_u32(&buf[pos..pos + 4]) as usize;
        let raw_end = pos + 4 + raw_len;
        if raw_end + 8 > buf.len() {
            return Err(Error::corrupt("sorted block", "entry key truncated"));
        }
        let raw = &buf[pos + 4..raw_end];
        let snapshot = BigEndian::read_u64(&buf[raw_end..raw_end + 8]);
        Ok((raw, snapshot))
    }

    fn cmp_key_at(&self, index: usize, key: &Key) -> Result<Ordering> {
        let (raw, snapshot) = self.key_at(index)?;
        Ok(raw.cmp(key.raw()).then(snapshot.cmp(&key.snapshot())))
    }

    /// Index of the greatest entry with key <= `key`, or `None` when
    /// every entry is greater.
    pub fn floor_index(&self, key: &Key) -> Result<Option<usize>> {
        let mut low = 0;
        let mut high = self.count;
        while low < high {
            let mid = low + (high - low) / 2;
            match self.cmp_key_at(mid, key)? {
                Ordering::Greater => high = mid,
                _ => low = mid + 1,
            }
        }
        Ok(low.checked_sub(1))
    }

    /// Index of the least entry with key >= `key`, or `None` when every
    /// entry is smaller.
    pub fn ceiling_index(&self, key: &Key) -> Result<Option<usize>> {
        match self.floor_index(key)? {
            None => Ok(if self.count > 0 { Some(0) } else { None }),
            Some(floor) => {
                if self.cmp_key_at(floor, key)? == Ordering::Equal {
                    Ok(Some(floor))
                } else if floor + 1 < self.count {
                    Ok(Some(floor + 1))
                } else {
                    Ok(None)
                }
            }
        }
    }

    pub fn first_key(&self) -> Result<Option<Key>> {
        if self.count == 0 {
            return Ok(None);
        }
        Ok(Some(self.tuple_at(0)?.key().clone()))
    }

    /// Iterate in `direction`, starting at the ceiling (ascending) or
    /// floor (descending) of `from` when given.
    pub fn iter(&self, direction: Direction, from: Option<&Key>) -> Result<SortedBlockIter> {
        let start = match (direction, from) {
            (Direction::Ascending, None) => (self.count > 0).then_some(0),
            (Direction::Ascending, Some(key)) => self.ceiling_index(key)?,
            (Direction::Descending, None) => self.count.checked_sub(1),
            (Direction::Descending, Some(key)) => self.floor_index(key)?,
        };
        Ok(SortedBlockIter {
            block: self.clone(),
            direction,
            next: start,
        })
    }
}

/// Iterator over one sorted block. Holds its own retain of the block.
pub struct SortedBlockIter {
    block: SortedBlock,
    direction: Direction,
    next: Option<usize>,
}

impl Iterator for SortedBlockIter {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let item = self.block.tuple_at(index);
        self.next = match (self.direction, item.is_ok()) {
            (_, false) => None,
            (Direction::Ascending, true) => (index + 1 < self.block.count).then_some(index + 1),
            (Direction::Descending, true) => index.checked_sub(1),
        };
        Some(item)
    }
}
