use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

/// Configuration for the store
#[derive(Debug, Clone)]
pub struct Config {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Maximum size for a memtable before rotation (default: 64MB)
    pub max_memtable_size: usize,

    /// Target size for serialized data blocks (default: 4KB)
    pub block_size: usize,

    /// Target size for serialized index blocks (default: 4KB)
    pub index_block_size: usize,

    /// Block cache capacity in bytes (default: 64MB)
    pub cache_capacity: usize,

    /// Target bloom filter false positive probability (default: 1%)
    pub bloom_fpp: f64,

    /// Number of flush worker threads (default: 1)
    pub flush_workers: usize,

    /// Flush queue depth before the caller runs the job itself (default: 4)
    pub flush_queue_depth: usize,

    /// Number of compaction worker threads (default: 1)
    pub compaction_workers: usize,

    /// Compaction write throughput ceiling in bytes per second; `None`
    /// means unlimited
    pub max_compaction_throughput: Option<u64>,

    /// Fsync the write-ahead log on every put (default: false)
    pub sync_writes: bool,

    /// How long close waits for worker pools to drain (default: 10s)
    pub shutdown_timeout: Duration,

    /// Compaction strategy selected at open
    pub compaction: CompactionStrategy,
}

/// Compaction strategy, chosen once when the store opens.
#[derive(Debug, Clone)]
pub enum CompactionStrategy {
    /// Group persistent tables into buckets of similar file size and
    /// merge buckets that grow past `min_tables` members.
    SizeTiered {
        min_tables: usize,
        max_tables: usize,
        bucket_low: f64,
        bucket_high: f64,
    },
    /// Merge every persistent table into one whenever more than
    /// `table_threshold` of them exist.
    Full { table_threshold: usize },
    /// Never compact.
    Null,
}

impl Default for CompactionStrategy {
    fn default() -> Self {
        CompactionStrategy::SizeTiered {
            min_tables: 4,
            max_tables: 32,
            bucket_low: 0.5,
            bucket_high: 1.5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tephra"),
            max_memtable_size: 64 * 1024 * 1024, // 64MB
            block_size: 4 * 1024,
            index_block_size: 4 * 1024,
            cache_capacity: 64 * 1024 * 1024, // 64MB
            bloom_fpp: 0.01,
            flush_workers: 1,
            flush_queue_depth: 4,
            compaction_workers: 1,
            max_compaction_throughput: None,
            sync_writes: false,
            shutdown_timeout: Duration::from_secs(10),
            compaction: CompactionStrategy::default(),
        }
    }
}

impl Config {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set maximum memtable size
    pub fn max_memtable_size(mut self, size: usize) -> Self {
        self.max_memtable_size = size;
        self
    }

    /// Set the target data block size
    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Set the target index block size
    pub fn index_block_size(mut self, size: usize) -> Self {
        self.index_block_size = size;
        self
    }

    /// Set block cache capacity in bytes
    pub fn cache_capacity(mut self, bytes: usize) -> Self {
        self.cache_capacity = bytes;
        self
    }

    /// Set target bloom filter false positive probability
    pub fn bloom_fpp(mut self, fpp: f64) -> Self {
        self.bloom_fpp = fpp;
        self
    }

    /// Set the number of flush worker threads
    pub fn flush_workers(mut self, workers: usize) -> Self {
        self.flush_workers = workers;
        self
    }

    /// Set the flush queue depth
    pub fn flush_queue_depth(mut self, depth: usize) -> Self {
        self.flush_queue_depth = depth;
        self
    }

    /// Set the number of compaction worker threads
    pub fn compaction_workers(mut self, workers: usize) -> Self {
        self.compaction_workers = workers;
        self
    }

    /// Cap compaction write throughput in bytes per second
    pub fn max_compaction_throughput(mut self, bytes_per_sec: u64) -> Self {
        self.max_compaction_throughput = Some(bytes_per_sec);
        self
    }

    /// Fsync the write-ahead log on every put
    pub fn sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Set the pool drain timeout used by close
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Select the compaction strategy
    pub fn compaction(mut self, strategy: CompactionStrategy) -> Self {
        self.compaction = strategy;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.max_memtable_size == 0 {
            return Err(Error::Config("max_memtable_size must be non-zero".into()));
        }
        if self.block_size < 64 || self.index_block_size < 64 {
            return Err(Error::Config("block sizes must be at least 64 bytes".into()));
        }
        if !(self.bloom_fpp > 0.0 && self.bloom_fpp < 1.0) {
            return Err(Error::Config("bloom_fpp must be in (0, 1)".into()));
        }
        if self.flush_workers == 0 || self.compaction_workers == 0 {
            return Err(Error::Config("worker counts must be non-zero".into()));
        }
        if self.max_compaction_throughput == Some(0) {
            return Err(Error::Config(
                "max_compaction_throughput must be non-zero when set".into(),
            ));
        }
        if let CompactionStrategy::SizeTiered {
            min_tables,
            max_tables,
            bucket_low,
            bucket_high,
        } = &self.compaction
        {
            if *min_tables < 2 || max_tables < min_tables {
                return Err(Error::Config(
                    "size-tiered needs min_tables >= 2 and max_tables >= min_tables".into(),
                ));
            }
            if !(*bucket_low > 0.0 && bucket_low < bucket_high) {
                return Err(Error::Config(
                    "size-tiered needs 0 < bucket_low < bucket_high".into(),
                ));
            }
        }
        Ok(())
    }

    /// Path of the published table file for `id`
    pub fn table_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.sst"))
    }

    /// Path the table file is written to before the publishing rename
    pub fn table_temp_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.sst.tmp"))
    }

    /// Path of the index file for table `id`
    pub fn index_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.idx"))
    }

    /// Path of the bloom filter file for table `id`
    pub fn filter_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.flt"))
    }

    /// Path of the write-ahead log for table `id`
    pub fn wal_path(&self, id: u64) -> PathBuf {
        self.dir.join(format!("{id}.wal"))
    }
}
