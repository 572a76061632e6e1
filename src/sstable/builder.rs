use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;

use byteorder::{BigEndian, WriteBytesExt};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::sstable::block::SortedBlockBuilder;
use crate::sstable::bloom::BloomFilterBuilder;
use crate::sstable::index::{BlockLocation, IndexWriter};
use crate::sstable::table::Trailer;
use crate::tuple::{Key, Tuple};

/// Streams an ascending run of tuples into a complete table: framed
/// data blocks, the B+tree index, the bloom filter, and the trailer.
///
/// The data file is written under a temporary name and renamed into
/// place by `finish` after everything is synced, so a table is either
/// fully published or invisible. Index and filter files are written
/// under their final names; startup recovery removes ones whose table
/// never made it.
pub struct TableBuilder {
    id: u64,
    level: u32,
    file: File,
    temp_path: PathBuf,
    final_path: PathBuf,
    filter_path: PathBuf,
    index: IndexWriter,
    filter: BloomFilterBuilder,
    block: SortedBlockBuilder,
    block_first_key: Option<Key>,
    block_size: usize,
    offset: u64,
    tuple_count: u64,
    max_snapshot: u64,
}

impl TableBuilder {
    pub fn new(config: &Config, id: u64, level: u32, expected_tuples: usize) -> Result<Self> {
        let temp_path = config.table_temp_path(id);
        Ok(Self {
            id,
            level,
            file: File::create(&temp_path)?,
            temp_path,
            final_path: config.table_path(id),
            filter_path: config.filter_path(id),
            index: IndexWriter::create(&config.index_path(id), config.index_block_size)?,
            filter: BloomFilterBuilder::new(expected_tuples, config.bloom_fpp),
            block: SortedBlockBuilder::new(),
            block_first_key: None,
            block_size: config.block_size,
            offset: 0,
            tuple_count: 0,
            max_snapshot: 0,
        })
    }

    /// Append the next tuple. Tuples must arrive in strictly ascending
    /// key order.
    pub fn add(&mut self, tuple: Tuple) -> Result<()> {
        if !self.block.is_empty() && self.block.current_size() >= self.block_size {
            self.flush_block()?;
        }
        if self.block_first_key.is_none() {
            self.block_first_key = Some(tuple.key().clone());
        }
        self.filter.insert(tuple.key().raw());
        self.max_snapshot = self.max_snapshot.max(tuple.key().snapshot());
        self.tuple_count += 1;
        self.block.add(&tuple);
        Ok(())
    }

    /// Write the current data block as `{u32 size, bytes, u32 size}`
    /// and record it in the index.
    fn flush_block(&mut self) -> Result<()> {
        let builder = std::mem::take(&mut self.block);
        if builder.is_empty() {
            return Ok(());
        }
        let first_key = self
            .block_first_key
            .take()
            .ok_or_else(|| Error::corrupt("table", "data block without a first key"))?;
        let bytes = builder.finish();
        let size = bytes.len() as u32;

        self.file.write_u32::<BigEndian>(size)?;
        self.file.write_all(&bytes)?;
        self.file.write_u32::<BigEndian>(size)?;

        self.index.add_leaf(
            first_key,
            BlockLocation {
                offset: self.offset + 4,
                size,
            },
        )?;
        self.offset += 8 + size as u64;
        Ok(())
    }

    /// Flush the last block, write the trailer, sync all three files
    /// and publish the table with an atomic rename.
    pub fn finish(mut self) -> Result<()> {
        self.flush_block()?;

        let trailer = Trailer {
            id: self.id,
            level: self.level,
            tuple_count: self.tuple_count,
            max_snapshot: self.max_snapshot,
        };
        self.file.write_all(&trailer.encode())?;
        self.file.sync_all()?;

        self.index.finish()?;

        let mut filter_file = File::create(&self.filter_path)?;
        filter_file.write_all(&self.filter.finish().encode())?;
        filter_file.sync_all()?;

        fs::rename(&self.temp_path, &self.final_path)?;
        tracing::debug!(
            table = self.id,
            level = self.level,
            tuples = self.tuple_count,
            "published table"
        );
        Ok(())
    }
}
