//! B+tree index over a table's data blocks.
//!
//! The index lives in its own file next to the table file. It is built
//! bottom-up while the table streams out: leaf records point at data
//! blocks, and whenever a level's block builder fills up the block is
//! written and its first key promoted into the level above. Reads walk
//! top-down from the root block.
//!
//! File layout: `{u32 len, block bytes}*` followed by a fixed trailer
//! `{root_size u32, root_offset u64}`.

use std::fs::File;
use std::io::Write;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};

use crate::cache::{BlockCache, BlockKind, CacheKey};
use crate::error::{Error, Result};
use crate::memory::BlockMut;
use crate::metrics::Metrics;
use crate::sstable::block::{SortedBlock, SortedBlockBuilder};
use crate::tuple::{Key, Tuple};

const TRAILER_LEN: u64 = 12;
const RECORD_LEN: usize = 13;

/// Offset and size of one block within a file. Offsets address the
/// block payload, past any length prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockLocation {
    pub offset: u64,
    pub size: u32,
}

/// Value of an index entry: where the child block lives and whether it
/// is a leaf record, i.e. points at a data block rather than another
/// index block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct IndexRecord {
    location: BlockLocation,
    leaf: bool,
}

impl IndexRecord {
    fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_LEN);
        // Writes into a Vec cannot fail.
        let _ = buf.write_u64::<BigEndian>(self.location.offset);
        let _ = buf.write_u32::<BigEndian>(self.location.size);
        buf.push(self.leaf as u8);
        buf
    }

    fn decode(buf: &[u8]) -> Result<IndexRecord> {
        if buf.len() != RECORD_LEN {
            return Err(Error::corrupt(
                "index record",
                format!("expected {RECORD_LEN} bytes, got {}", buf.len()),
            ));
        }
        Ok(IndexRecord {
            location: BlockLocation {
                offset: BigEndian::read_u64(&buf[0..8]),
                size: BigEndian::read_u32(&buf[8..12]),
            },
            leaf: buf[12] != 0,
        })
    }
}

/// Streams leaf records into a bottom-up B+tree index file.
pub struct IndexWriter {
    file: File,
    offset: u64,
    block_size: usize,
    levels: Vec<SortedBlockBuilder>,
    first_keys: Vec<Option<Key>>,
}

impl IndexWriter {
    pub fn create(path: &Path, block_size: usize) -> Result<Self> {
        Ok(Self {
            file: File::create(path)?,
            offset: 0,
            block_size,
            levels: Vec::new(),
            first_keys: Vec::new(),
        })
    }

    /// Record that the data block at `location` starts with `key`.
    /// Keys must arrive in ascending order.
    pub fn add_leaf(&mut self, key: Key, location: BlockLocation) -> Result<()> {
        self.insert(0, key, IndexRecord { location, leaf: true })
    }

    fn insert(&mut self, level: usize, key: Key, record: IndexRecord) -> Result<()> {
        while self.levels.len() <= level {
            self.levels.push(SortedBlockBuilder::new());
            self.first_keys.push(None);
        }
        if self.levels[level].is_empty() {
            self.first_keys[level] = Some(key.clone());
        }
        self.levels[level].add(&Tuple::new(key, record.encode()));
        if self.levels[level].current_size() >= self.block_size {
            self.flush_level(level)?;
        }
        Ok(())
    }

    /// Write out level `level`'s current block and promote its first
    /// key one level up.
    fn flush_level(&mut self, level: usize) -> Result<()> {
        let builder = std::mem::take(&mut self.levels[level]);
        if builder.is_empty() {
            return Ok(());
        }
        let first_key = self.first_keys[level]
            .take()
            .ok_or_else(|| Error::corrupt("index", "level block without a first key"))?;
        let location = self.write_block(builder.finish())?;
        // The promoted record points at the index block just written,
        // never at a data block.
        self.insert(level + 1, first_key, IndexRecord { location, leaf: false })
    }

    fn write_block(&mut self, bytes: Vec<u8>) -> Result<BlockLocation> {
        self.file.write_u32::<BigEndian>(bytes.len() as u32)?;
        self.file.write_all(&bytes)?;
        let location = BlockLocation {
            offset: self.offset + 4,
            size: bytes.len() as u32,
        };
        self.offset += 4 + bytes.len() as u64;
        Ok(location)
    }

    /// Flush every residual level bottom-up, write the root block and
    /// the trailer, and sync the file.
    pub fn finish(mut self) -> Result<()> {
        if self.levels.is_empty() {
            // Index of an empty table: a root with no entries.
            self.levels.push(SortedBlockBuilder::new());
            self.first_keys.push(None);
        }

        let mut level = 0;
        let mut root = None;
        while level < self.levels.len() {
            let is_top = level + 1 == self.levels.len();
            if is_top {
                let builder = std::mem::take(&mut self.levels[level]);
                root = Some(self.write_block(builder.finish())?);
            } else if !self.levels[level].is_empty() {
                self.flush_level(level)?;
            }
            level += 1;
        }

        // root is always set: the loop's last pass writes the top level.
        let root = root.ok_or_else(|| Error::corrupt("index", "no root block written"))?;
        let mut trailer = Vec::with_capacity(TRAILER_LEN as usize);
        let _ = trailer.write_u32::<BigEndian>(root.size);
        let _ = trailer.write_u64::<BigEndian>(root.offset);
        self.file.write_all(&trailer)?;
        self.file.sync_all()?;
        Ok(())
    }
}

/// Read side of the index: holds the root block resident and fetches
/// deeper blocks through the shared cache.
pub struct IndexReader {
    file: File,
    table: u64,
    root: SortedBlock,
    cache: Arc<BlockCache>,
    metrics: Arc<Metrics>,
}

impl IndexReader {
    pub fn open(
        path: &Path,
        table: u64,
        cache: Arc<BlockCache>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        if len < TRAILER_LEN {
            return Err(Error::corrupt("index", "file shorter than trailer"));
        }
        let mut trailer = [0u8; TRAILER_LEN as usize];
        file.read_exact_at(&mut trailer, len - TRAILER_LEN)?;
        let root_size = BigEndian::read_u32(&trailer[0..4]);
        let root_offset = BigEndian::read_u64(&trailer[4..12]);
        if root_offset + root_size as u64 > len - TRAILER_LEN {
            return Err(Error::corrupt("index", "root block out of bounds"));
        }

        let mut root = BlockMut::with_len(root_size as usize);
        file.read_exact_at(root.as_mut_slice(), root_offset)?;
        let root = SortedBlock::new(root.freeze())?;

        Ok(Self {
            file,
            table,
            root,
            cache,
            metrics,
        })
    }

    /// Locate the data block whose key range may contain `key`.
    /// Returns `None` when `key` sorts before the table's first key.
    pub fn find(&self, key: &Key) -> Result<Option<BlockLocation>> {
        let mut depth = 1u64;
        let mut current = self.root.clone();
        loop {
            let index = match current.floor_index(key)? {
                Some(index) => index,
                None => {
                    self.metrics.index_search(depth);
                    return Ok(None);
                }
            };
            let record = IndexRecord::decode(current.tuple_at(index)?.value())?;
            if record.leaf {
                self.metrics.index_search(depth);
                tracing::trace!(table = self.table, depth, "index search");
                return Ok(Some(record.location));
            }
            depth += 1;
            current = self.read_block(record.location)?;
        }
    }

    fn read_block(&self, location: BlockLocation) -> Result<SortedBlock> {
        let key = CacheKey {
            table: self.table,
            kind: BlockKind::Index,
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(raw: &[u8], snapshot: u64) -> Key {
        Key::new(raw.to_vec(), snapshot)
    }

    fn build_index(dir: &TempDir, block_size: usize, entries: u64) -> std::path::PathBuf {
        let path = dir.path().join("test.idx");
        let mut writer = IndexWriter::create(&path, block_size).unwrap();
        for i in 0..entries {
            let raw = format!("key-{i:06}").into_bytes();
            writer
                .add_leaf(
                    Key::new(raw, 1),
                    BlockLocation {
                        offset: i * 100,
                        size: 100,
                    },
                )
                .unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn open_reader(path: &Path) -> (IndexReader, Arc<Metrics>) {
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(1 << 20, metrics.clone()));
        (
            IndexReader::open(path, 1, cache, metrics.clone()).unwrap(),
            metrics,
        )
    }

    #[test]
    fn test_record_roundtrip() {
        let record = IndexRecord {
            location: BlockLocation {
                offset: 4096,
                size: 512,
            },
            leaf: true,
        };
        assert_eq!(IndexRecord::decode(&record.encode()).unwrap(), record);
        assert!(IndexRecord::decode(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_single_level_find() {
        let dir = TempDir::new().unwrap();
        let path = build_index(&dir, 1 << 16, 10);
        let (reader, metrics) = open_reader(&path);

        // Exact first keys resolve to their block.
        let loc = reader.find(&key(b"key-000003", 1)).unwrap().unwrap();
        assert_eq!(loc.offset, 300);

        // A key between two entries falls into the preceding block.
        let loc = reader.find(&key(b"key-000003x", 0)).unwrap().unwrap();
        assert_eq!(loc.offset, 300);

        // Before the first entry.
        assert!(reader.find(&key(b"aaa", 0)).unwrap().is_none());

        // Past the last entry lands in the last block.
        let loc = reader.find(&key(b"zzz", 0)).unwrap().unwrap();
        assert_eq!(loc.offset, 900);

        assert_eq!(metrics.snapshot().index_depth_total, 4);
    }

    #[test]
    fn test_multi_level_find() {
        let dir = TempDir::new().unwrap();
        // Tiny index blocks force several levels.
        let path = build_index(&dir, 128, 500);
        let (reader, metrics) = open_reader(&path);

        for i in [0u64, 1, 57, 499] {
            let raw = format!("key-{i:06}").into_bytes();
            let loc = reader.find(&Key::new(raw, 1)).unwrap().unwrap();
            assert_eq!(loc.offset, i * 100, "entry {i}");
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.index_searches, 4);
        // Multi-level: average depth beyond the root.
        assert!(snap.index_depth_total > snap.index_searches);
    }

    #[test]
    fn test_empty_index() {
        let dir = TempDir::new().unwrap();
        let path = build_index(&dir, 4096, 0);
        let (reader, _) = open_reader(&path);
        assert!(reader.find(&key(b"anything", 1)).unwrap().is_none());
    }

    #[test]
    fn test_open_rejects_truncated_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("short.idx");
        std::fs::write(&path, [0u8; 5]).unwrap();
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(1024, metrics.clone()));
        assert!(IndexReader::open(&path, 1, cache, metrics).is_err());
    }
}
