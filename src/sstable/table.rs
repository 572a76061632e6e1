//! Published, immutable table file.
//!
//! Layout: framed data blocks `{u32 size, block bytes, u32 size}` back
//! to back from offset zero, then a fixed trailer. The length suffix on
//! each frame lets descending scans walk the file backwards without
//! touching the index.

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use crate::cache::{BlockCache, BlockKind, CacheKey};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::memory::BlockMut;
use crate::metrics::Metrics;
use crate::merge::Direction;
use crate::sstable::block::{SortedBlock, SortedBlockIter};
use crate::sstable::bloom::BloomFilter;
use crate::sstable::index::{BlockLocation, IndexReader};
use crate::tuple::{Key, Tuple};

pub const TRAILER_LEN: u64 = 28;

/// Fixed-size table file trailer: `{id u64, level u32, tuple_count u64,
/// max_snapshot u64}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trailer {
    pub id: u64,
    pub level: u32,
    pub tuple_count: u64,
    pub max_snapshot: u64,
}

impl Trailer {
    pub fn encode(&self) -> [u8; TRAILER_LEN as usize] {
        let mut buf = [0u8; TRAILER_LEN as usize];
        BigEndian::write_u64(&mut buf[0..8], self.id);
        BigEndian::write_u32(&mut buf[8..12], self.level);
        BigEndian::write_u64(&mut buf[12..20], self.tuple_count);
        BigEndian::write_u64(&mut buf[20..28], self.max_snapshot);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Trailer> {
        if buf.len() != TRAILER_LEN as usize {
            return Err(Error::corrupt("table trailer", "wrong length"));
        }
        Ok(Trailer {
            id: BigEndian::read_u64(&buf[0..8]),
            level: BigEndian::read_u32(&buf[8..12]),
            tuple_count: BigEndian::read_u64(&buf[12..20]),
            max_snapshot: BigEndian::read_u64(&buf[20..28]),
        })
    }
}

/// An open, immutable table: data file plus its index and bloom filter.
pub struct FileTable {
    trailer: Trailer,
    file: File,
    /// Offset just past the last data frame.
    data_end: u64,
    file_size: u64,
    index: IndexReader,
    filter: BloomFilter,
    cache: Arc<BlockCache>,
}

impl FileTable {
    pub fn open(
        config: &Config,
        id: u64,
        cache: Arc<BlockCache>,
        metrics: Arc<Metrics>,
    ) -> Result<FileTable> {
        let path = config.table_path(id);
        let file = File::open(&path)?;
        let file_size = file.metadata()?.len();
        if file_size < TRAILER_LEN {
            return Err(Error::corrupt("table", "file shorter than trailer"));
        }
        let mut buf = [0u8; TRAILER_LEN as usize];
        file.read_exact_at(&mut buf, file_size - TRAILER_LEN)?;
        let trailer = Trailer::decode(&buf)?;
        if trailer.id != id {
            return Err(Error::corrupt(
                "table",
                format!("trailer id {} does not match file {}", trailer.id, id),
            ));
        }

        let index = IndexReader::open(&config.index_path(id), id, cache.clone(), metrics)?;
        let filter = BloomFilter::decode(&std::fs::read(config.filter_path(id))?)?;

        Ok(FileTable {
            trailer,
            file,
            data_end: file_size - TRAILER_LEN,
            file_size,
            index,
            filter,
            cache,
        })
    }

    pub fn id(&self) -> u64 {
        self.trailer.id
    }

    pub fn level(&self) -> u32 {
        self.trailer.level
    }

    pub fn tuple_count(&self) -> u64 {
        self.trailer.tuple_count
    }

    pub fn max_snapshot(&self) -> u64 {
        self.trailer.max_snapshot
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// False when the table definitely holds no version of `raw`.
    pub fn might_contain(&self, raw: &[u8]) -> bool {
        self.filter.might_contain(raw)
    }

    /// Greatest version of `raw` with snapshot id <= `ceiling`, if this
    /// table holds one.
    pub fn get(&self, raw: &[u8], ceiling: u64) -> Result<Option<Tuple>> {
        let probe = Key::new(raw.to_vec(), ceiling);
        let location = match self.index.find(&probe)? {
            Some(location) => location,
            None => return Ok(None),
        };
        let block = self.read_data_block(location)?;
        let index = match block.floor_index(&probe)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let tuple = block.tuple_at(index)?;
        if tuple.key().raw() == raw {
            Ok(Some(tuple))
        } else {
            Ok(None)
        }
    }

    /// Iterate the whole table, optionally from the floor/ceiling of
    /// `from` in the scan direction.
    pub fn iter(
        self: &Arc<Self>,
        direction: Direction,
        from: Option<&Key>,
    ) -> Result<FileTableIter> {
        let mut iter = FileTableIter {
            table: Arc::clone(self),
            direction,
            pos: match direction {
                Direction::Ascending => 0,
                Direction::Descending => self.data_end,
            },
            inner: None,
            finished: false,
        };
        if let Some(key) = from {
            match self.index.find(key)? {
                Some(location) => {
                    let block = self.read_data_block(location)?;
                    iter.inner = Some(block.iter(direction, Some(key))?);
                    iter.pos = match direction {
                        // Next frame starts past this one's suffix.
                        Direction::Ascending => location.offset + location.size as u64 + 4,
                        // Previous frame ends at this one's prefix.
                        Direction::Descending => location.offset - 4,
                    };
                }
                None => {
                    // Key sorts before the whole table: ascending scans
                    // start at the beginning, descending scans see
                    // nothing.
                    if direction == Direction::Descending {
                        iter.finished = true;
                    }
                }
            }
        }
        Ok(iter)
    }

    fn read_data_block(&self, location: BlockLocation) -> Result<SortedBlock> {
        let key = CacheKey {
            table: self.trailer.id,
            kind: BlockKind::Data,
            offset: location.offset,
        };
        if let Some(block) = self.cache.get(&key) {
            return SortedBlock::new(block);
        }
        let mut buf = BlockMut::with_len(location.size as usize);
        self.file.read_exact_at(buf.as_mut_slice(), location.offset)?;
        let block = buf.freeze();
        self.cache.insert(key, block.retain());
        SortedBlock::new(block)
    }

    fn read_frame_len(&self, offset: u64) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.file.read_exact_at(&mut buf, offset)?;
        Ok(BigEndian::read_u32(&buf))
    }
}

impl std::fmt::Debug for FileTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileTable")
            .field("id", &self.trailer.id)
            .field("level", &self.trailer.level)
            .field("tuples", &self.trailer.tuple_count)
            .finish()
    }
}

/// Tuple iterator chaining a table's data blocks in either direction.
pub struct FileTableIter {
    table: Arc<FileTable>,
    direction: Direction,
    /// Ascending: offset of the next frame's length prefix.
    /// Descending: offset just past the next frame's length suffix.
    pos: u64,
    inner: Option<SortedBlockIter>,
    finished: bool,
}

impl FileTableIter {
    fn load_next_block(&mut self) -> Result<Option<SortedBlockIter>> {
        match self.direction {
            Direction::Ascending => {
                if self.pos >= self.table.data_end {
                    return Ok(None);
                }
                let size = self.table.read_frame_len(self.pos)?;
                let location = BlockLocation {
                    offset: self.pos + 4,
                    size,
                };
                self.pos += 8 + size as u64;
                let block = self.table.read_data_block(location)?;
                Ok(Some(block.iter(self.direction, None)?))
            }
            Direction::Descending => {
                if self.pos == 0 {
                    return Ok(None);
                }
                let size = self.table.read_frame_len(self.pos - 4)?;
                let frame_len = 8 + size as u64;
                if frame_len > self.pos {
                    return Err(Error::corrupt("table", "frame suffix out of bounds"));
                }
                let location = BlockLocation {
                    offset: self.pos - 4 - size as u64,
                    size,
                };
                self.pos -= frame_len;
                let block = self.table.read_data_block(location)?;
                Ok(Some(block.iter(self.direction, None)?))
            }
        }
    }
}

impl Iterator for FileTableIter {
    type Item = Result<Tuple>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            if let Some(inner) = &mut self.inner {
                if let Some(item) = inner.next() {
                    if item.is_err() {
                        self.finished = true;
                    }
                    return Some(item);
                }
            }
            match self.load_next_block() {
                Ok(Some(inner)) => self.inner = Some(inner),
                Ok(None) => {
                    self.finished = true;
                    return None;
                }
                Err(e) => {
                    self.finished = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
