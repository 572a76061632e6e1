use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cache::BlockCache;
use crate::config::Config;
use crate::error::Result;
use crate::memtable::MemTable;
use crate::merge::Direction;
use crate::metrics::Metrics;
use crate::sstable::{FileTable, TableBuilder};
use crate::tableset::{TableRef, TableSet};
use crate::tuple::{Key, Snapshot, Tuple};
use crate::wal::Wal;

/// The active write target: a memtable and the log that makes its
/// contents recoverable.
struct ActiveTable {
    mem: Arc<MemTable>,
    wal: Arc<Wal>,
}

struct WriterState {
    active: Option<ActiveTable>,
    next_snapshot: u64,
}

/// Write side of the store. All writes pass through one critical
/// section that assigns the snapshot id, appends to the WAL, and only
/// then inserts into the memtable, so a tuple is never readable before
/// it is recoverable.
pub struct TableWriter {
    config: Arc<Config>,
    set: Arc<TableSet>,
    cache: Arc<BlockCache>,
    metrics: Arc<Metrics>,
    state: Mutex<WriterState>,
    flush_pool: Mutex<crate::pool::WorkerPool>,
}

impl TableWriter {
    pub fn new(
        config: Arc<Config>,
        set: Arc<TableSet>,
        cache: Arc<BlockCache>,
        metrics: Arc<Metrics>,
        next_snapshot: u64,
    ) -> TableWriter {
        let flush_pool = crate::pool::WorkerPool::new(
            "flush",
            config.flush_workers,
            config.flush_queue_depth,
        );
        TableWriter {
            config,
            set,
            cache,
            metrics,
            state: Mutex::new(WriterState {
                active: None,
                next_snapshot: next_snapshot.max(1),
            }),
            flush_pool: Mutex::new(flush_pool),
        }
    }

    /// Write one version. Returns the snapshot id assigned to it. An
    /// empty `value` records a deletion.
    pub fn put(&self, raw: &[u8], value: &[u8], fsync: bool) -> Result<Snapshot> {
        let mut state = self.state.lock().unwrap();
        self.ensure_active(&mut state)?;

        let snapshot = state.next_snapshot;
        let tuple = Tuple::new(Key::new(raw.to_vec(), snapshot), value.to_vec());
        // Invariant: WAL before memtable. If the append fails the
        // tuple never becomes visible and the id is simply skipped.
        let active = state.active.as_ref().unwrap();
        active.wal.append(&tuple, fsync)?;
        active.mem.put(tuple);
        state.next_snapshot += 1;
        Ok(Snapshot(snapshot))
    }

    /// Rotate in a fresh memtable when there is none or the current one
    /// has reached the size threshold; the old one is handed to the
    /// flush pool.
    fn ensure_active(&self, state: &mut WriterState) -> Result<()> {
        let rotate = match &state.active {
            None => true,
            Some(active) => active.mem.approximate_size() >= self.config.max_memtable_size,
        };
        if !rotate {
            return Ok(());
        }

        if let Some(old) = state.active.take() {
            // Everything appended so far must be durable before the
            // memtable leaves the write path.
            old.wal.flush()?;
            self.spawn_flush(old);
        }

        let id = self.set.next_id();
        let wal = Arc::new(Wal::create(&self.config.wal_path(id))?);
        let mem = Arc::new(MemTable::new(id));
        self.set.add(TableRef::Mem(Arc::clone(&mem)));
        tracing::info!(table = id, "rotated to new memtable");
        state.active = Some(ActiveTable { mem, wal });
        Ok(())
    }

    fn spawn_flush(&self, active: ActiveTable) {
        let config = Arc::clone(&self.config);
        let set = Arc::clone(&self.set);
        let cache = Arc::clone(&self.cache);
        let metrics = Arc::clone(&self.metrics);
        self.flush_pool.lock().unwrap().submit(Box::new(move || {
            let id = active.mem.id();
            if let Err(e) =
                flush_memtable(&config, &set, &cache, &metrics, &active.mem, active.wal.path())
            {
                tracing::error!(table = id, error = %e, "memtable flush failed");
            }
        }));
    }

    /// Flush the active memtable synchronously.
    pub fn flush(&self) -> Result<()> {
        let active = self.state.lock().unwrap().active.take();
        if let Some(active) = active {
            active.wal.flush()?;
            flush_memtable(
                &self.config,
                &self.set,
                &self.cache,
                &self.metrics,
                &active.mem,
                active.wal.path(),
            )?;
        }
        Ok(())
    }

    /// Flush pending data and drain the flush pool. Idempotent.
    pub fn close(&self, timeout: Duration) -> Result<()> {
        self.flush()?;
        self.flush_pool.lock().unwrap().shutdown(timeout)
    }
}

/// Convert a memtable into a published file table and swap it into the
/// set under the same id, then delete the WAL it no longer needs.
pub(crate) fn flush_memtable(
    config: &Config,
    set: &TableSet,
    cache: &Arc<BlockCache>,
    metrics: &Arc<Metrics>,
    mem: &Arc<MemTable>,
    wal_path: &Path,
) -> Result<()> {
    let id = mem.id();
    if mem.is_empty() {
        set.remove(id);
        remove_file_logged(wal_path);
        return Ok(());
    }

    let mut builder = TableBuilder::new(config, id, 1, mem.tuple_count())?;
    for tuple in mem.iter(Direction::Ascending, None) {
        builder.add(tuple?)?;
    }
    builder.finish()?;

    let table = FileTable::open(config, id, Arc::clone(cache), Arc::clone(metrics))?;
    let tuples = table.tuple_count();
    set.swap(&[id], TableRef::File(Arc::new(table)));
    remove_file_logged(wal_path);

    metrics.flush_completed();
    tracing::info!(table = id, tuples, "flushed memtable to table");
    Ok(())
}

fn remove_file_logged(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        tracing::warn!(path = %path.display(), error = %e, "failed to delete file");
    }
}
