//! Tiered compaction: planners choose input tables, the executor merges
//! them into one output table on the next level. Version resolution is
//! deliberately absent; every version and tombstone survives a merge so
//! old snapshots stay readable.

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::BlockCache;
use crate::config::{CompactionStrategy, Config};
use crate::error::Result;
use crate::merge::{Direction, MergeIterator};
use crate::metrics::Metrics;
use crate::sstable::{FileTable, TableBuilder};
use crate::tableset::{TableRef, TableSet};

/// One unit of compaction work: which tables to merge and where the
/// output lands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    pub inputs: Vec<u64>,
    pub target_level: u32,
}

/// Chooses compaction work from the current file tables.
pub trait Planner: Send + Sync {
    fn name(&self) -> &'static str;

    /// Tasks worth running against this set of tables, oldest first.
    fn plan(&self, tables: &[Arc<FileTable>]) -> Vec<CompactionTask>;

    /// Quick check used to decide whether to keep looping.
    fn needs(&self, tables: &[Arc<FileTable>]) -> bool {
        !self.plan(tables).is_empty()
    }
}

pub fn planner_for(strategy: &CompactionStrategy) -> Box<dyn Planner> {
    match strategy {
        CompactionStrategy::SizeTiered {
            min_tables,
            max_tables,
            bucket_low,
            bucket_high,
        } => Box::new(SizeTieredPlanner {
            min_tables: *min_tables,
            max_tables: *max_tables,
            bucket_low: *bucket_low,
            bucket_high: *bucket_high,
        }),
        CompactionStrategy::Full { table_threshold } => Box::new(FullPlanner {
            table_threshold: *table_threshold,
        }),
        CompactionStrategy::Null => Box::new(NullPlanner),
    }
}

/// Groups tables of similar size into buckets and merges buckets that
/// have accumulated enough members.
pub struct SizeTieredPlanner {
    pub min_tables: usize,
    pub max_tables: usize,
    pub bucket_low: f64,
    pub bucket_high: f64,
}

impl Planner for SizeTieredPlanner {
    fn name(&self) -> &'static str {
        "size-tiered"
    }

    fn plan(&self, tables: &[Arc<FileTable>]) -> Vec<CompactionTask> {
        let mut buckets: Vec<Vec<&Arc<FileTable>>> = Vec::new();
        for table in tables {
            let size = table.file_size() as f64;
            let found = buckets.iter_mut().find(|bucket| {
                let avg = bucket.iter().map(|t| t.file_size() as f64).sum::<f64>()
                    / bucket.len() as f64;
                size >= avg * self.bucket_low && size <= avg * self.bucket_high
            });
            match found {
                Some(bucket) => bucket.push(table),
                None => buckets.push(vec![table]),
            }
        }

        buckets
            .into_iter()
            .filter(|bucket| bucket.len() >= self.min_tables)
            .map(|mut bucket| {
                // Oldest first, capped so one task stays bounded.
                bucket.sort_by_key(|t| t.id());
                bucket.truncate(self.max_tables);
                CompactionTask {
                    target_level: bucket.iter().map(|t| t.level()).max().unwrap_or(0) + 1,
                    inputs: bucket.iter().map(|t| t.id()).collect(),
                }
            })
            .collect()
    }
}

/// Merges everything into one table once the count passes a threshold.
pub struct FullPlanner {
    pub table_threshold: usize,
}

impl Planner for FullPlanner {
    fn name(&self) -> &'static str {
        "full"
    }

    fn plan(&self, tables: &[Arc<FileTable>]) -> Vec<CompactionTask> {
        if tables.len() <= self.table_threshold || tables.len() < 2 {
            return Vec::new();
        }
        let mut inputs: Vec<u64> = tables.iter().map(|t| t.id()).collect();
        inputs.sort_unstable();
        vec![CompactionTask {
            target_level: tables.iter().map(|t| t.level()).max().unwrap_or(0) + 1,
            inputs,
        }]
    }
}

/// Never plans anything.
pub struct NullPlanner;

impl Planner for NullPlanner {
    fn name(&self) -> &'static str {
        "null"
    }

    fn plan(&self, _tables: &[Arc<FileTable>]) -> Vec<CompactionTask> {
        Vec::new()
    }
}

/// Token bucket limiting compaction write throughput. The bucket
/// refills continuously at the configured rate and a debt puts the
/// worker to sleep until it is paid off.
struct Throttle {
    bytes_per_sec: u64,
    available: f64,
    last: Instant,
}

impl Throttle {
    fn new(bytes_per_sec: u64) -> Throttle {
        Throttle {
            bytes_per_sec,
            available: bytes_per_sec as f64,
            last: Instant::now(),
        }
    }

    fn take(&mut self, bytes: usize) {
        let now = Instant::now();
        let refill = now.duration_since(self.last).as_secs_f64() * self.bytes_per_sec as f64;
        self.available = (self.available + refill).min(self.bytes_per_sec as f64);
        self.last = now;
        self.available -= bytes as f64;
        if self.available < 0.0 {
            thread::sleep(Duration::from_secs_f64(
                -self.available / self.bytes_per_sec as f64,
            ));
        }
    }
}

/// Merge the task's input tables into one output table, publish it in
/// place of the inputs, and delete the input files.
pub fn run_compaction(
    task: &CompactionTask,
    set: &TableSet,
    config: &Config,
    cache: &Arc<BlockCache>,
    metrics: &Arc<Metrics>,
) -> Result<()> {
    let live = set.file_tables();
    let mut inputs = Vec::with_capacity(task.inputs.len());
    for id in &task.inputs {
        match live.iter().find(|t| t.id() == *id) {
            Some(table) => inputs.push(Arc::clone(table)),
            None => {
                // The set moved under a stale plan. Skip the task; the
                // next planning round sees the current state.
                tracing::debug!(table = id, "compaction input no longer live, skipping task");
                return Ok(());
            }
        }
    }

    let new_id = set.next_id();
    let expected = inputs.iter().map(|t| t.tuple_count()).sum::<u64>() as usize;
    tracing::info!(
        output = new_id,
        inputs = ?task.inputs,
        level = task.target_level,
        "compaction started"
    );

    let sources = inputs
        .iter()
        .map(|table| table.iter(Direction::Ascending, None).map(|iter| {
            Box::new(iter) as crate::merge::TupleIter
        }))
        .collect::<Result<Vec<_>>>()?;
    let merged = MergeIterator::new(sources, Direction::Ascending)?;

    let mut throttle = config.max_compaction_throughput.map(Throttle::new);
    let mut builder = TableBuilder::new(config, new_id, task.target_level, expected)?;
    for tuple in merged {
        let tuple = tuple?;
        if let Some(throttle) = &mut throttle {
            throttle.take(tuple.encoded_len());
        }
        builder.add(tuple)?;
    }
    builder.finish()?;

    let output = FileTable::open(config, new_id, Arc::clone(cache), Arc::clone(metrics))?;
    set.swap(&task.inputs, TableRef::File(Arc::new(output)));

    for id in &task.inputs {
        cache.invalidate(*id);
        remove_table_files(config, *id);
    }

    metrics.compaction_completed();
    tracing::info!(output = new_id, "compaction finished");
    Ok(())
}

/// Best-effort deletion of a table's on-disk files. A leftover file is
/// picked up by the startup sweep of the next open.
pub(crate) fn remove_table_files(config: &Config, id: u64) {
    for path in [
        config.table_path(id),
        config.index_path(id),
        config.filter_path(id),
    ] {
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %path.display(), error = %e, "failed to delete table file");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memtable::MemTable;
    use crate::tuple::{Key, Tuple};
    use crate::writer::flush_memtable;
    use tempfile::TempDir;

    fn harness(dir: &TempDir) -> (Arc<Config>, Arc<TableSet>, Arc<BlockCache>, Arc<Metrics>) {
        let config = Arc::new(Config::new(dir.path()));
        let metrics = Arc::new(Metrics::new());
        let cache = Arc::new(BlockCache::new(1 << 20, metrics.clone()));
        let set = Arc::new(TableSet::new(1));
        (config, set, cache, metrics)
    }

    fn build_table(
        config: &Config,
        set: &TableSet,
        cache: &Arc<BlockCache>,
        metrics: &Arc<Metrics>,
        tuples: &[(&[u8], u64, &[u8])],
    ) -> u64 {
        let id = set.next_id();
        let mem = Arc::new(MemTable::new(id));
        for (raw, snapshot, value) in tuples {
            mem.put(Tuple::new(Key::new(raw.to_vec(), *snapshot), value.to_vec()));
        }
        set.add(TableRef::Mem(Arc::clone(&mem)));
        let wal = config.wal_path(id);
        std::fs::write(&wal, b"").unwrap();
        flush_memtable(config, set, cache, metrics, &mem, &wal).unwrap();
        id
    }

    #[test]
    fn test_size_tiered_waits_for_min_tables() {
        let dir = TempDir::new().unwrap();
        let (config, set, cache, metrics) = harness(&dir);
        let planner = SizeTieredPlanner {
            min_tables: 4,
            max_tables: 32,
            bucket_low: 0.5,
            bucket_high: 1.5,
        };

        for i in 0..3 {
            build_table(&config, &set, &cache, &metrics, &[(b"k", i + 1, b"v")]);
        }
        assert!(planner.plan(&set.file_tables()).is_empty());

        build_table(&config, &set, &cache, &metrics, &[(b"k", 9, b"v")]);
        let tasks = planner.plan(&set.file_tables());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].inputs.len(), 4);
        assert_eq!(tasks[0].target_level, 2);
    }

    #[test]
    fn test_size_tiered_splits_disparate_sizes() {
        let planner = SizeTieredPlanner {
            min_tables: 2,
            max_tables: 32,
            bucket_low: 0.5,
            bucket_high: 1.5,
        };
        // Planning only looks at file sizes, so drive it through real
        // tables of very different sizes.
        let dir = TempDir::new().unwrap();
        let (config, set, cache, metrics) = harness(&dir);

        let big: Vec<u8> = vec![7u8; 64 * 1024];
        build_table(&config, &set, &cache, &metrics, &[(b"big", 1, &big)]);
        build_table(&config, &set, &cache, &metrics, &[(b"a", 2, b"v")]);
        build_table(&config, &set, &cache, &metrics, &[(b"b", 3, b"v")]);

        let tasks = planner.plan(&set.file_tables());
        assert_eq!(tasks.len(), 1);
        // Only the two small tables bucket together.
        assert_eq!(tasks[0].inputs.len(), 2);
    }

    #[test]
    fn test_full_planner_thresholds() {
        let dir = TempDir::new().unwrap();
        let (config, set, cache, metrics) = harness(&dir);
        let planner = FullPlanner { table_threshold: 2 };

        build_table(&config, &set, &cache, &metrics, &[(b"a", 1, b"v")]);
        build_table(&config, &set, &cache, &metrics, &[(b"b", 2, b"v")]);
        assert!(planner.plan(&set.file_tables()).is_empty());

        build_table(&config, &set, &cache, &metrics, &[(b"c", 3, b"v")]);
        let tasks = planner.plan(&set.file_tables());
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].inputs, vec![1, 2, 3]);
    }

    #[test]
    fn test_throttle_sleeps_on_deficit() {
        let mut throttle = Throttle::new(10_000);
        let start = Instant::now();
        // The bucket starts full; overdrawing by 1000 bytes costs
        // roughly 100ms at 10kB/s.
        throttle.take(11_000);
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_throttle_within_budget_does_not_sleep() {
        let mut throttle = Throttle::new(1 << 30);
        let start = Instant::now();
        for _ in 0..100 {
            throttle.take(1024);
        }
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn test_null_planner_never_plans() {
        let planner = NullPlanner;
        assert!(planner.plan(&[]).is_empty());
        assert!(!planner.needs(&[]));
    }

    #[test]
    fn test_run_compaction_merges_and_cleans_up() {
        let dir = TempDir::new().unwrap();
        let (config, set, cache, metrics) = harness(&dir);

        let a = build_table(&config, &set, &cache, &metrics, &[(b"k", 1, b"old"), (b"x", 2, b"x2")]);
        let b = build_table(&config, &set, &cache, &metrics, &[(b"k", 5, b"new")]);

        let task = CompactionTask {
            inputs: vec![a, b],
            target_level: 2,
        };
        run_compaction(&task, &set, &config, &cache, &metrics).unwrap();

        let tables = set.file_tables();
        assert_eq!(tables.len(), 1);
        let output = &tables[0];
        assert_eq!(output.level(), 2);
        // Every version survives the merge.
        assert_eq!(output.tuple_count(), 3);
        assert_eq!(output.get(b"k", u64::MAX).unwrap().unwrap().value(), b"new");
        assert_eq!(output.get(b"k", 4).unwrap().unwrap().value(), b"old");

        assert!(!config.table_path(a).exists());
        assert!(!config.table_path(b).exists());
        assert_eq!(metrics.snapshot().compactions, 1);
    }

    #[test]
    fn test_run_compaction_skips_stale_task() {
        let dir = TempDir::new().unwrap();
        let (config, set, cache, metrics) = harness(&dir);
        let a = build_table(&config, &set, &cache, &metrics, &[(b"a", 1, b"v")]);

        let task = CompactionTask {
            inputs: vec![a, 999],
            target_level: 2,
        };
        run_compaction(&task, &set, &config, &cache, &metrics).unwrap();

        // Nothing changed.
        let tables = set.file_tables();
        assert_eq!(tables.len(), 1);
        assert_eq!(tables[0].id(), a);
    }
}
